//! Length-prefixed plist framing for lockdown and plist-based services.
//!
//! Each message is a 4-byte big-endian length followed by exactly that many
//! bytes of serialized property list. The host always sends XML; devices
//! answer with XML or binary plists.
//!
//! These functions are synchronous and work on byte slices. Blocking socket
//! wrappers live in the client crate.

use std::io::Cursor;

use bytes::{BufMut, BytesMut};
use plist::{Dictionary, Value};

use crate::error::{ProtoError, Result};

/// Maximum allowed message size (16 MiB). Prevents unbounded allocation
/// from malformed length prefixes.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

const BINARY_PLIST_MAGIC: &[u8] = b"bplist00";
const XML_PLIST_PREFIX: &[u8] = b"<?xml";

/// Serialize a dictionary as an XML plist body (no length prefix).
pub fn encode_body(dict: &Dictionary) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    Value::Dictionary(dict.clone()).to_writer_xml(&mut body)?;
    Ok(body)
}

/// Parse a plist body into its top-level dictionary.
///
/// Binary and XML plists are accepted. XML bodies are stripped of control
/// characters first: some devices embed NUL bytes in `HardwarePlatform`.
pub fn decode_body(payload: &[u8]) -> Result<Dictionary> {
    let value = if payload.starts_with(BINARY_PLIST_MAGIC) {
        Value::from_reader(Cursor::new(payload))?
    } else if payload.starts_with(XML_PLIST_PREFIX) {
        Value::from_reader_xml(Cursor::new(strip_control_bytes(payload)))?
    } else {
        let preview = &payload[..payload.len().min(16)];
        return Err(ProtoError::Malformed(format!(
            "not a property list: {preview:02x?}"
        )));
    };

    value
        .into_dictionary()
        .ok_or_else(|| ProtoError::Malformed("top-level plist is not a dictionary".into()))
}

/// Encode a dictionary with a big-endian length prefix.
///
/// Returns the encoded bytes: `[u32 BE length][XML plist]`.
pub fn encode_frame(dict: &Dictionary) -> Result<Vec<u8>> {
    let mut buf = BytesMut::new();
    encode_into(dict, &mut buf)?;
    Ok(buf.to_vec())
}

/// Encode a length-prefixed dictionary into a `BytesMut`.
pub fn encode_into(dict: &Dictionary, buf: &mut BytesMut) -> Result<()> {
    let body = encode_body(dict)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(ProtoError::MessageTooLarge(body.len()));
    }
    buf.reserve(LENGTH_PREFIX_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(())
}

/// Decode the length prefix, rejecting frames over [`MAX_MESSAGE_SIZE`].
pub fn frame_length(prefix: [u8; LENGTH_PREFIX_SIZE]) -> Result<usize> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtoError::MessageTooLarge(len));
    }
    Ok(len)
}

/// Try to decode a length-prefixed dictionary from a buffer.
///
/// Returns `Ok(Some((dict, bytes_consumed)))` if a complete frame is
/// available, `Ok(None)` if more data is needed, or `Err` on malformed data.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Dictionary, usize)>> {
    let Some(prefix) = buf.get(..LENGTH_PREFIX_SIZE) else {
        return Ok(None);
    };
    let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
    len_bytes.copy_from_slice(prefix);
    let payload_len = frame_length(len_bytes)?;

    let total_needed = LENGTH_PREFIX_SIZE + payload_len;
    if buf.len() < total_needed {
        return Ok(None);
    }

    let dict = decode_body(&buf[LENGTH_PREFIX_SIZE..total_needed])?;
    Ok(Some((dict, total_needed)))
}

fn strip_control_bytes(payload: &[u8]) -> Vec<u8> {
    payload
        .iter()
        .copied()
        .filter(|&b| b >= 0x20 || matches!(b, b'\t' | b'\n' | b'\r'))
        .collect()
}
