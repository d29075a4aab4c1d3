//! Negotiate Endpoint
//!
//! `POST <base>/negotiate` hands browser clients a fresh connection id
//! and the transport list before they open the WebSocket. The endpoint
//! does its own CORS: the response must echo the request Origin and allow
//! credentials, which a wildcard CORS layer cannot express.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use serde::Serialize;

use super::error::ServerResult;
use crate::connection::generate_connection_id;

/// One entry of the advertised transport list
#[derive(Debug, Serialize)]
pub struct AvailableTransport {
    pub transport: String,
    #[serde(rename = "transferFormats")]
    pub transfer_formats: Vec<String>,
}

/// Body of a successful negotiate response
#[derive(Debug, Serialize)]
pub struct NegotiateResponse {
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    #[serde(rename = "availableTransports")]
    pub available_transports: Vec<AvailableTransport>,
}

impl NegotiateResponse {
    pub fn new(connection_id: String) -> Self {
        Self {
            connection_id,
            available_transports: vec![AvailableTransport {
                transport: "WebSockets".to_string(),
                transfer_formats: vec!["Text".to_string(), "Binary".to_string()],
            }],
        }
    }
}

/// Negotiate handler; accepts any method and sorts them out itself.
///
/// `OPTIONS` answers the CORS preflight with 204, `POST` issues the
/// connection id, anything else is a 400. A serialization failure of the
/// response body surfaces as a 500.
pub async fn negotiate(method: Method, headers: HeaderMap) -> ServerResult<Response> {
    let origin = headers.get(header::ORIGIN).cloned();

    if method == Method::OPTIONS {
        let mut builder = Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true")
            .header(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                "x-requested-with, authorization",
            );
        if let Some(origin) = origin {
            builder = builder.header(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        }
        if let Some(requested) = headers.get(header::ACCESS_CONTROL_REQUEST_METHOD) {
            builder = builder.header(header::ACCESS_CONTROL_ALLOW_METHODS, requested.clone());
        }
        return Ok(builder.body(Body::empty())?);
    }

    let mut builder = Response::builder()
        .header(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true")
        .header(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_str(method.as_str())
                .unwrap_or_else(|_| HeaderValue::from_static("POST")),
        );
    if let Some(origin) = origin {
        builder = builder.header(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    }

    if method != Method::POST {
        return Ok(builder.status(StatusCode::BAD_REQUEST).body(Body::empty())?);
    }

    let connection_id = generate_connection_id();
    tracing::debug!(connection_id = %connection_id, "negotiated new connection");

    let body = serde_json::to_vec(&NegotiateResponse::new(connection_id))?;
    Ok(builder
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))?)
}
