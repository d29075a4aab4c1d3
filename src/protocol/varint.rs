//! Varint Length Codec
//!
//! Binary service frames are prefixed with a self-delimiting length:
//! little-endian, 7 payload bits per byte, high bit set on every byte
//! except the last. At most 5 bytes (35 bits of length) are allowed.

use super::ProtocolError;

/// Maximum number of bytes a length prefix may occupy.
pub const MAX_LENGTH_PREFIX_BYTES: usize = 5;

/// Largest length representable in a 5-byte prefix (35 bits).
pub const MAX_FRAME_LENGTH: u64 = (1 << 35) - 1;

/// Append the minimal varint encoding of `len` to `out`.
///
/// Lengths above [`MAX_FRAME_LENGTH`] do not fit in the 5-byte prefix and
/// are rejected.
pub fn write_len(len: u64, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
    if len > MAX_FRAME_LENGTH {
        return Err(ProtocolError::MalformedLength(format!(
            "length {} exceeds the 35-bit limit",
            len
        )));
    }

    let mut remaining = len;
    loop {
        let mut current = (remaining & 0x7f) as u8;
        remaining >>= 7;
        if remaining > 0 {
            current |= 0x80;
        }
        out.push(current);
        if remaining == 0 {
            return Ok(());
        }
    }
}

/// Decode a varint length prefix from the front of `buf`.
///
/// Returns the decoded length and the number of prefix bytes consumed.
/// Fails with a malformed-length error if the continuation chain runs past
/// 5 bytes or past the end of the buffer.
pub fn read_len(buf: &[u8]) -> Result<(u64, usize), ProtocolError> {
    let mut length: u64 = 0;
    let mut consumed = 0usize;

    loop {
        if consumed == MAX_LENGTH_PREFIX_BYTES {
            return Err(ProtocolError::MalformedLength(
                "continuation bit set past the 5-byte limit".to_string(),
            ));
        }
        let byte = *buf.get(consumed).ok_or_else(|| {
            ProtocolError::MalformedLength(
                "buffer ended inside the length prefix".to_string(),
            )
        })?;

        length |= u64::from(byte & 0x7f) << (consumed * 7);
        consumed += 1;

        if byte & 0x80 == 0 {
            return Ok((length, consumed));
        }
    }
}
