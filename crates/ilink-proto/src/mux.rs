//! usbmuxd control packets.
//!
//! Every control packet starts with a 16-byte little-endian header
//! `[length, version, message, tag]` where `length` includes the header.
//! Two payload dialects share that header:
//!
//! - **binary** (version 0): fixed C-struct payloads per message type.
//! - **plist** (version 1): message type is always [`message::PLIST`] and the
//!   payload is an XML plist carrying `MessageType` plus request keys.
//!
//! Clients try binary first and fall back to plist when the daemon answers
//! with a different header version.

use std::fmt;

use bytes::{BufMut, BytesMut};
use plist::{Dictionary, Value};

use crate::codec;
use crate::error::{ProtoError, Result};

/// Size of the control packet header.
pub const HEADER_SIZE: usize = 16;

/// Default daemon socket on Unix hosts.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/usbmuxd";

/// Loopback TCP port used where Unix sockets are unavailable.
pub const DEFAULT_TCP_PORT: u16 = 27015;

/// `ClientVersionString` sent with every plist request.
pub const CLIENT_VERSION_STRING: &str = "ilink-usbmuxd";

/// `ProgName` sent with every plist request.
pub const PROG_NAME: &str = "ilink";

/// Fixed width of the NUL-padded serial field in a binary device-add payload.
pub const SERIAL_FIELD_SIZE: usize = 256;

/// Upper bound on a whole control packet. Device lists and pairing records
/// are a few KiB; anything near this is a corrupt length field.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// device id (4) + product id (2) + serial (256) + padding (2) + location (4).
const DEVICE_ADD_PAYLOAD_SIZE: usize = 4 + 2 + SERIAL_FIELD_SIZE + 2 + 4;

/// Binary message type codes.
pub mod message {
    pub const RESULT: u32 = 1;
    pub const CONNECT: u32 = 2;
    pub const LISTEN: u32 = 3;
    pub const DEVICE_ADD: u32 = 4;
    pub const DEVICE_REMOVE: u32 = 5;
    pub const PLIST: u32 = 8;
}

/// Which payload dialect a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxProtocol {
    Binary,
    Plist,
}

impl MuxProtocol {
    /// Header version field for this dialect.
    pub fn version(self) -> u32 {
        match self {
            Self::Binary => 0,
            Self::Plist => 1,
        }
    }
}

/// The fixed control packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxHeader {
    pub length: u32,
    pub version: u32,
    pub message: u32,
    pub tag: u32,
}

impl MuxHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.length.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..12].copy_from_slice(&self.message.to_le_bytes());
        out[12..16].copy_from_slice(&self.tag.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtoError::Truncated {
                what: "mux header",
                need: HEADER_SIZE,
                have: buf.len(),
            });
        }
        let header = Self {
            length: read_u32(buf, 0),
            version: read_u32(buf, 4),
            message: read_u32(buf, 8),
            tag: read_u32(buf, 12),
        };
        if (header.length as usize) < HEADER_SIZE || header.length as usize > MAX_PACKET_SIZE {
            return Err(ProtoError::InvalidLength(u64::from(header.length)));
        }
        Ok(header)
    }

    /// Number of payload bytes following the header.
    pub fn payload_len(&self) -> usize {
        (self.length as usize).saturating_sub(HEADER_SIZE)
    }
}

/// A device announced by the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxDevice {
    pub device_id: u32,
    pub product_id: u16,
    pub serial: String,
    pub location_id: u32,
}

impl fmt::Display for MuxDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MuxDevice(id {} product 0x{:04x} serial {:?} location 0x{:x})",
            self.device_id, self.product_id, self.serial, self.location_id
        )
    }
}

/// Requests a client can send on a control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxRequest {
    Listen,
    Connect { device_id: u32, port: u16 },
    /// Only meaningful on the plist dialect.
    ReadPairRecord { record_id: String },
}

impl MuxRequest {
    fn plist_message_type(&self) -> &'static str {
        match self {
            Self::Listen => "Listen",
            Self::Connect { .. } => "Connect",
            Self::ReadPairRecord { .. } => "ReadPairRecord",
        }
    }
}

/// Packets a daemon can send back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxReply {
    /// Reply to a request; zero means success.
    Result(u32),
    Attached(MuxDevice),
    Detached(u32),
    /// Raw plist bytes of a stored pairing record.
    PairRecord(Vec<u8>),
}

/// Encode a complete control packet (header + payload).
pub fn encode_request(protocol: MuxProtocol, tag: u32, request: &MuxRequest) -> Result<Vec<u8>> {
    let (message_type, payload) = match protocol {
        MuxProtocol::Binary => (binary_message_type(request)?, binary_payload(request)),
        MuxProtocol::Plist => (message::PLIST, codec::encode_body(&plist_payload(request))?),
    };

    let header = MuxHeader {
        length: (HEADER_SIZE + payload.len()) as u32,
        version: protocol.version(),
        message: message_type,
        tag,
    };

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_slice(&header.encode());
    buf.put_slice(&payload);
    Ok(buf.to_vec())
}

/// Decode the payload that followed `header`.
///
/// The caller is responsible for checking `header.version` against the
/// dialect it expects.
pub fn decode_reply(protocol: MuxProtocol, header: &MuxHeader, payload: &[u8]) -> Result<MuxReply> {
    match protocol {
        MuxProtocol::Binary => decode_binary(header.message, payload),
        MuxProtocol::Plist => {
            if header.message != message::PLIST {
                return Err(ProtoError::UnexpectedMessage(format!(
                    "non-plist message type {} on plist connection",
                    header.message
                )));
            }
            decode_plist(&codec::decode_body(payload)?)
        }
    }
}

fn binary_message_type(request: &MuxRequest) -> Result<u32> {
    match request {
        MuxRequest::Listen => Ok(message::LISTEN),
        MuxRequest::Connect { .. } => Ok(message::CONNECT),
        MuxRequest::ReadPairRecord { .. } => Err(ProtoError::UnexpectedMessage(
            "ReadPairRecord requires the plist protocol".into(),
        )),
    }
}

fn binary_payload(request: &MuxRequest) -> Vec<u8> {
    match request {
        MuxRequest::Connect { device_id, port } => {
            let mut buf = Vec::with_capacity(8);
            buf.extend_from_slice(&device_id.to_le_bytes());
            // Port travels in network byte order, then two reserved bytes.
            buf.extend_from_slice(&port.to_be_bytes());
            buf.extend_from_slice(&[0, 0]);
            buf
        }
        MuxRequest::Listen | MuxRequest::ReadPairRecord { .. } => Vec::new(),
    }
}

fn plist_payload(request: &MuxRequest) -> Dictionary {
    let mut dict = Dictionary::new();
    dict.insert(
        "MessageType".into(),
        Value::String(request.plist_message_type().into()),
    );
    dict.insert(
        "ClientVersionString".into(),
        Value::String(CLIENT_VERSION_STRING.into()),
    );
    dict.insert("ProgName".into(), Value::String(PROG_NAME.into()));

    match request {
        MuxRequest::Listen => {}
        MuxRequest::Connect { device_id, port } => {
            dict.insert("DeviceID".into(), Value::Integer(u64::from(*device_id).into()));
            // Same byte-swapped value the binary dialect puts on the wire.
            dict.insert(
                "PortNumber".into(),
                Value::Integer(u64::from(port.swap_bytes()).into()),
            );
        }
        MuxRequest::ReadPairRecord { record_id } => {
            dict.insert("PairRecordID".into(), Value::String(record_id.clone()));
        }
    }
    dict
}

fn decode_binary(message_type: u32, payload: &[u8]) -> Result<MuxReply> {
    match message_type {
        message::RESULT => Ok(MuxReply::Result(expect_u32(payload, "result payload")?)),
        message::DEVICE_ADD => {
            if payload.len() < DEVICE_ADD_PAYLOAD_SIZE {
                return Err(ProtoError::Truncated {
                    what: "device-add payload",
                    need: DEVICE_ADD_PAYLOAD_SIZE,
                    have: payload.len(),
                });
            }
            let serial_field = &payload[6..6 + SERIAL_FIELD_SIZE];
            let serial_end = serial_field
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(SERIAL_FIELD_SIZE);
            let serial = std::str::from_utf8(&serial_field[..serial_end])
                .map_err(|_| ProtoError::InvalidUtf8("device serial"))?
                .to_owned();

            Ok(MuxReply::Attached(MuxDevice {
                device_id: read_u32(payload, 0),
                product_id: u16::from_le_bytes([payload[4], payload[5]]),
                serial,
                location_id: read_u32(payload, 6 + SERIAL_FIELD_SIZE + 2),
            }))
        }
        message::DEVICE_REMOVE => Ok(MuxReply::Detached(expect_u32(payload, "device-remove payload")?)),
        other => Err(ProtoError::UnexpectedMessage(format!(
            "binary message type {other}"
        ))),
    }
}

fn decode_plist(dict: &Dictionary) -> Result<MuxReply> {
    if let Some(data) = dict.get("PairRecordData").and_then(Value::as_data) {
        return Ok(MuxReply::PairRecord(data.to_vec()));
    }

    let message_type = dict
        .get("MessageType")
        .and_then(Value::as_string)
        .unwrap_or_default();

    match message_type {
        "Result" => Ok(MuxReply::Result(dict_u32(dict, "Number")?)),
        "Attached" => {
            let props = dict
                .get("Properties")
                .and_then(Value::as_dictionary)
                .ok_or_else(|| ProtoError::Malformed("Attached without Properties".into()))?;
            let serial = props
                .get("SerialNumber")
                .and_then(Value::as_string)
                .ok_or_else(|| ProtoError::Malformed("Attached without SerialNumber".into()))?;
            Ok(MuxReply::Attached(MuxDevice {
                device_id: dict_u32(dict, "DeviceID")?,
                product_id: dict_u32(props, "ProductID")? as u16,
                serial: serial.to_owned(),
                location_id: dict_u32(props, "LocationID").unwrap_or(0),
            }))
        }
        "Detached" => Ok(MuxReply::Detached(dict_u32(dict, "DeviceID")?)),
        other => Err(ProtoError::UnexpectedMessage(format!(
            "plist message type {other:?}"
        ))),
    }
}

fn dict_u32(dict: &Dictionary, key: &'static str) -> Result<u32> {
    dict.get(key)
        .and_then(Value::as_unsigned_integer)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| ProtoError::Malformed(format!("missing or invalid {key}")))
}

fn expect_u32(payload: &[u8], what: &'static str) -> Result<u32> {
    if payload.len() < 4 {
        return Err(ProtoError::Truncated {
            what,
            need: 4,
            have: payload.len(),
        });
    }
    Ok(read_u32(payload, 0))
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
