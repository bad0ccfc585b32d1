//! AFC (Apple File Conduit) packet format.
//!
//! Every AFC packet is a fixed 40-byte little-endian header followed by an
//! operation-specific payload:
//!
//! ```text
//! [magic "CFA6LPAA"][entire_length u64][this_length u64][packet_num u64][operation u64]
//! ```
//!
//! `entire_length` covers header and payload. `this_length` normally equals
//! `entire_length`; write requests are the exception and always declare 48.
//! A reply whose operation is [`Opcode::Status`] carries a u64 status code in
//! the first eight payload bytes; any other reply opcode means success and the
//! payload is the result data.

use std::collections::BTreeMap;
use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::error::{ProtoError, Result};

/// Packet magic.
pub const MAGIC: &[u8; 8] = b"CFA6LPAA";

/// Fixed header size.
pub const HEADER_SIZE: usize = 40;

/// Largest read requested in a single `READ` packet.
pub const MAX_READ_SIZE: usize = 1 << 16;

/// Largest payload sent in a single `WRITE` packet.
pub const MAX_WRITE_SIZE: usize = 1 << 15;

/// `this_length` declared by every write packet, whatever the chunk size.
pub const WRITE_THIS_LENGTH: u64 = 48;

/// Modification times below this are taken to be seconds, not nanoseconds.
pub const MTIME_SECONDS_THRESHOLD: u64 = 2_000_000_000;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Upper bound on a single reply, guards against corrupt length fields.
const MAX_PACKET_SIZE: u64 = 64 * 1024 * 1024;

/// AFC operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Status,
    Data,
    ReadDir,
    RemovePath,
    MakeDir,
    GetFileInfo,
    GetDevInfo,
    FileOpen,
    FileOpenResult,
    Read,
    Write,
    FileSeek,
    FileTell,
    FileTellResult,
    FileClose,
    FileSetSize,
    RenamePath,
    MakeLink,
    GetFileHash,
    SetFileTime,
    GetSizeOfPathContents,
    Other(u64),
}

impl Opcode {
    pub fn code(self) -> u64 {
        match self {
            Self::Status => 0x01,
            Self::Data => 0x02,
            Self::ReadDir => 0x03,
            Self::RemovePath => 0x08,
            Self::MakeDir => 0x09,
            Self::GetFileInfo => 0x0a,
            Self::GetDevInfo => 0x0b,
            Self::FileOpen => 0x0d,
            Self::FileOpenResult => 0x0e,
            Self::Read => 0x0f,
            Self::Write => 0x10,
            Self::FileSeek => 0x11,
            Self::FileTell => 0x12,
            Self::FileTellResult => 0x13,
            Self::FileClose => 0x14,
            Self::FileSetSize => 0x15,
            Self::RenamePath => 0x18,
            Self::MakeLink => 0x1c,
            Self::GetFileHash => 0x1d,
            Self::SetFileTime => 0x1e,
            Self::GetSizeOfPathContents => 0x21,
            Self::Other(code) => code,
        }
    }

    pub fn from_code(code: u64) -> Self {
        match code {
            0x01 => Self::Status,
            0x02 => Self::Data,
            0x03 => Self::ReadDir,
            0x08 => Self::RemovePath,
            0x09 => Self::MakeDir,
            0x0a => Self::GetFileInfo,
            0x0b => Self::GetDevInfo,
            0x0d => Self::FileOpen,
            0x0e => Self::FileOpenResult,
            0x0f => Self::Read,
            0x10 => Self::Write,
            0x11 => Self::FileSeek,
            0x12 => Self::FileTell,
            0x13 => Self::FileTellResult,
            0x14 => Self::FileClose,
            0x15 => Self::FileSetSize,
            0x18 => Self::RenamePath,
            0x1c => Self::MakeLink,
            0x1d => Self::GetFileHash,
            0x1e => Self::SetFileTime,
            0x21 => Self::GetSizeOfPathContents,
            other => Self::Other(other),
        }
    }

    /// Stable name used in error messages and logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Status => "AFC_OP_STATUS",
            Self::Data => "AFC_OP_DATA",
            Self::ReadDir => "AFC_OP_READ_DIR",
            Self::RemovePath => "AFC_OP_REMOVE_PATH",
            Self::MakeDir => "AFC_OP_MAKE_DIR",
            Self::GetFileInfo => "AFC_OP_GET_FILE_INFO",
            Self::GetDevInfo => "AFC_OP_GET_DEVINFO",
            Self::FileOpen => "AFC_OP_FILE_OPEN",
            Self::FileOpenResult => "AFC_OP_FILE_OPEN_RES",
            Self::Read => "AFC_OP_READ",
            Self::Write => "AFC_OP_WRITE",
            Self::FileSeek => "AFC_OP_FILE_SEEK",
            Self::FileTell => "AFC_OP_FILE_TELL",
            Self::FileTellResult => "AFC_OP_FILE_TELL_RES",
            Self::FileClose => "AFC_OP_FILE_CLOSE",
            Self::FileSetSize => "AFC_OP_FILE_SET_SIZE",
            Self::RenamePath => "AFC_OP_RENAME_PATH",
            Self::MakeLink => "AFC_OP_MAKE_LINK",
            Self::GetFileHash => "AFC_OP_GET_FILE_HASH",
            Self::SetFileTime => "AFC_OP_SET_FILE_TIME",
            Self::GetSizeOfPathContents => "AFC_OP_GET_SIZE_OF_PATH_CONTENTS",
            Self::Other(_) => "AFC_OP_UNKNOWN",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "AFC_OP_UNKNOWN(0x{code:02x})"),
            other => f.write_str(other.name()),
        }
    }
}

/// AFC status codes carried by `STATUS` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AfcStatus {
    Success,
    UnknownError,
    OpHeaderInvalid,
    NoResources,
    ReadError,
    WriteError,
    UnknownPacketType,
    InvalidArg,
    ObjectNotFound,
    ObjectIsDir,
    PermDenied,
    ServiceNotConnected,
    OpTimeout,
    TooMuchData,
    EndOfData,
    OpNotSupported,
    ObjectExists,
    ObjectBusy,
    NoSpaceLeft,
    OpWouldBlock,
    IoError,
    OpInterrupted,
    OpInProgress,
    InternalError,
    MuxError,
    NoMem,
    NotEnoughData,
    DirNotEmpty,
    Other(u64),
}

impl AfcStatus {
    pub fn from_code(code: u64) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::UnknownError,
            2 => Self::OpHeaderInvalid,
            3 => Self::NoResources,
            4 => Self::ReadError,
            5 => Self::WriteError,
            6 => Self::UnknownPacketType,
            7 => Self::InvalidArg,
            8 => Self::ObjectNotFound,
            9 => Self::ObjectIsDir,
            10 => Self::PermDenied,
            11 => Self::ServiceNotConnected,
            12 => Self::OpTimeout,
            13 => Self::TooMuchData,
            14 => Self::EndOfData,
            15 => Self::OpNotSupported,
            16 => Self::ObjectExists,
            17 => Self::ObjectBusy,
            18 => Self::NoSpaceLeft,
            19 => Self::OpWouldBlock,
            20 => Self::IoError,
            21 => Self::OpInterrupted,
            22 => Self::OpInProgress,
            23 => Self::InternalError,
            30 => Self::MuxError,
            31 => Self::NoMem,
            32 => Self::NotEnoughData,
            33 => Self::DirNotEmpty,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u64 {
        match self {
            Self::Success => 0,
            Self::UnknownError => 1,
            Self::OpHeaderInvalid => 2,
            Self::NoResources => 3,
            Self::ReadError => 4,
            Self::WriteError => 5,
            Self::UnknownPacketType => 6,
            Self::InvalidArg => 7,
            Self::ObjectNotFound => 8,
            Self::ObjectIsDir => 9,
            Self::PermDenied => 10,
            Self::ServiceNotConnected => 11,
            Self::OpTimeout => 12,
            Self::TooMuchData => 13,
            Self::EndOfData => 14,
            Self::OpNotSupported => 15,
            Self::ObjectExists => 16,
            Self::ObjectBusy => 17,
            Self::NoSpaceLeft => 18,
            Self::OpWouldBlock => 19,
            Self::IoError => 20,
            Self::OpInterrupted => 21,
            Self::OpInProgress => 22,
            Self::InternalError => 23,
            Self::MuxError => 30,
            Self::NoMem => 31,
            Self::NotEnoughData => 32,
            Self::DirNotEmpty => 33,
            Self::Other(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for AfcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({})", self.code())
    }
}

/// Modes accepted by `FILE_OPEN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
    WriteOnly,
    WriteRead,
    Append,
    ReadAppend,
}

impl OpenMode {
    pub fn code(self) -> u64 {
        match self {
            Self::ReadOnly => 1,
            Self::ReadWrite => 2,
            Self::WriteOnly => 3,
            Self::WriteRead => 4,
            Self::Append => 5,
            Self::ReadAppend => 6,
        }
    }
}

/// Link flavours accepted by `MAKE_LINK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Hard,
    Symbolic,
}

impl LinkKind {
    pub fn code(self) -> u64 {
        match self {
            Self::Hard => 1,
            Self::Symbolic => 2,
        }
    }
}

/// The fixed 40-byte packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub entire_length: u64,
    pub this_length: u64,
    pub packet_num: u64,
    pub operation: Opcode,
}

impl PacketHeader {
    /// Header for a packet carrying `payload_len` bytes, with `this_length`
    /// equal to `entire_length` unless overridden.
    pub fn new(operation: Opcode, packet_num: u64, payload_len: usize, this_length: Option<u64>) -> Self {
        let entire_length = (HEADER_SIZE + payload_len) as u64;
        Self {
            entire_length,
            this_length: this_length.unwrap_or(entire_length),
            packet_num,
            operation,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_slice(MAGIC);
        buf.put_u64_le(self.entire_length);
        buf.put_u64_le(self.this_length);
        buf.put_u64_le(self.packet_num);
        buf.put_u64_le(self.operation.code());

        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtoError::Truncated {
                what: "AFC header",
                need: HEADER_SIZE,
                have: buf.len(),
            });
        }
        if &buf[..8] != MAGIC {
            let mut magic = [0u8; 8];
            magic.copy_from_slice(&buf[..8]);
            return Err(ProtoError::BadMagic(magic));
        }

        let entire_length = decode_u64(&buf[8..16])?;
        if entire_length < HEADER_SIZE as u64 || entire_length > MAX_PACKET_SIZE {
            return Err(ProtoError::InvalidLength(entire_length));
        }

        Ok(Self {
            entire_length,
            this_length: decode_u64(&buf[16..24])?,
            packet_num: decode_u64(&buf[24..32])?,
            operation: Opcode::from_code(decode_u64(&buf[32..40])?),
        })
    }

    pub fn payload_len(&self) -> usize {
        (self.entire_length as usize).saturating_sub(HEADER_SIZE)
    }
}

/// Split a reply into status and data.
///
/// `STATUS` replies yield their code and no data; any other reply is an
/// implicit success with the payload as data.
pub fn status_from_reply(header: &PacketHeader, payload: &[u8]) -> Result<AfcStatus> {
    if header.operation == Opcode::Status {
        Ok(AfcStatus::from_code(decode_u64(payload)?))
    } else {
        Ok(AfcStatus::Success)
    }
}

/// Read a little-endian u64 from the start of `buf`.
pub fn decode_u64(buf: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = buf
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or(ProtoError::Truncated {
            what: "u64 field",
            need: 8,
            have: buf.len(),
        })?;
    Ok(u64::from_le_bytes(bytes))
}

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// `path\0`
pub fn path_payload(path: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(path.len() + 1);
    push_cstr(&mut buf, path);
    buf
}

/// `mode u64` + `path\0`
pub fn open_payload(mode: OpenMode, path: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + path.len() + 1);
    buf.extend_from_slice(&mode.code().to_le_bytes());
    push_cstr(&mut buf, path);
    buf
}

/// `kind u64` + `target\0` + `link_name\0`
pub fn link_payload(kind: LinkKind, target: &str, link_name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + target.len() + link_name.len() + 2);
    buf.extend_from_slice(&kind.code().to_le_bytes());
    push_cstr(&mut buf, target);
    push_cstr(&mut buf, link_name);
    buf
}

/// `from\0` + `to\0`
pub fn rename_payload(from: &str, to: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(from.len() + to.len() + 2);
    push_cstr(&mut buf, from);
    push_cstr(&mut buf, to);
    buf
}

/// `handle u64`
pub fn handle_payload(handle: u64) -> Vec<u8> {
    handle.to_le_bytes().to_vec()
}

/// `handle u64` + `whence 0` + `offset u64`. Offsets are always resolved to
/// absolute positions before they reach the wire.
pub fn seek_payload(handle: u64, absolute: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24);
    buf.extend_from_slice(&handle.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes());
    buf.extend_from_slice(&absolute.to_le_bytes());
    buf
}

/// `handle u64` + `value u64`, shared by `READ` (byte count) and
/// `FILE_SET_SIZE` (new length).
pub fn handle_value_payload(handle: u64, value: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&handle.to_le_bytes());
    buf.extend_from_slice(&value.to_le_bytes());
    buf
}

/// `mtime_ns u64` + `path\0`
pub fn set_mtime_payload(path: &str, mtime: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + path.len() + 1);
    buf.extend_from_slice(&normalize_mtime(mtime).to_le_bytes());
    push_cstr(&mut buf, path);
    buf
}

/// Scale a seconds timestamp to nanoseconds; larger values pass through.
pub fn normalize_mtime(mtime: u64) -> u64 {
    if mtime < MTIME_SECONDS_THRESHOLD {
        mtime.saturating_mul(NANOS_PER_SECOND)
    } else {
        mtime
    }
}

fn push_cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

// ---------------------------------------------------------------------------
// Reply decoders
// ---------------------------------------------------------------------------

/// Decode a NUL-separated `key\0value\0...` list.
///
/// The segment after the final NUL is discarded; the remaining segment count
/// must be even.
pub fn decode_key_values(data: &[u8]) -> Result<BTreeMap<String, String>> {
    let segments = split_nul(data)?;
    if segments.len() % 2 != 0 {
        return Err(ProtoError::OddKeyValueCount(segments.len()));
    }
    Ok(segments
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect())
}

/// Decode a NUL-separated name list, dropping empty entries.
pub fn decode_name_list(data: &[u8]) -> Result<Vec<String>> {
    Ok(split_nul(data)?
        .into_iter()
        .filter(|name| !name.is_empty())
        .collect())
}

fn split_nul(data: &[u8]) -> Result<Vec<String>> {
    let mut segments: Vec<&[u8]> = data.split(|&b| b == 0).collect();
    segments.pop();
    segments
        .into_iter()
        .map(|s| {
            std::str::from_utf8(s)
                .map(str::to_owned)
                .map_err(|_| ProtoError::InvalidUtf8("AFC string list"))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Seek resolution
// ---------------------------------------------------------------------------

/// Resolve a seek relative to the current position. The result must land in
/// `[0, size]`.
pub fn resolve_from_current(current: u64, offset: i64, size: u64) -> Result<u64> {
    let target = i128::from(current) + i128::from(offset);
    if target < 0 || target > i128::from(size) {
        return Err(ProtoError::InvalidSeek(format!(
            "position {current}{offset:+} outside [0, {size}]"
        )));
    }
    Ok(target as u64)
}

/// Resolve a seek relative to the end of the file. Only non-positive offsets
/// are accepted.
pub fn resolve_from_end(size: u64, offset: i64) -> Result<u64> {
    if offset > 0 {
        return Err(ProtoError::InvalidSeek(format!(
            "offset {offset} past end of file"
        )));
    }
    let target = i128::from(size) + i128::from(offset);
    if target < 0 {
        return Err(ProtoError::InvalidSeek(format!(
            "offset {offset} before start of a {size}-byte file"
        )));
    }
    Ok(target as u64)
}

// ---------------------------------------------------------------------------
// File info
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Unknown,
}

impl FileKind {
    fn from_ifmt(ifmt: &str) -> Self {
        match ifmt {
            "S_IFREG" => Self::File,
            "S_IFDIR" => Self::Directory,
            "S_IFLNK" => Self::Symlink,
            "S_IFCHR" => Self::CharDevice,
            "S_IFBLK" => Self::BlockDevice,
            "S_IFIFO" => Self::Fifo,
            "S_IFSOCK" => Self::Socket,
            _ => Self::Unknown,
        }
    }
}

/// Typed view over a `GET_FILE_INFO` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub blocks: u64,
    pub nlink: u64,
    pub kind: FileKind,
    pub mtime_ns: u64,
    pub birthtime_ns: u64,
    pub link_target: Option<String>,
    /// Every key the device sent, including ones not mapped above.
    pub raw: BTreeMap<String, String>,
}

impl FileInfo {
    pub fn from_map(raw: BTreeMap<String, String>) -> Result<Self> {
        let number = |key: &'static str| -> Result<u64> {
            match raw.get(key) {
                None => Ok(0),
                Some(v) => v
                    .parse()
                    .map_err(|_| ProtoError::Malformed(format!("{key} is not a number: {v:?}"))),
            }
        };

        Ok(Self {
            size: number("st_size")?,
            blocks: number("st_blocks")?,
            nlink: number("st_nlink")?,
            kind: raw
                .get("st_ifmt")
                .map_or(FileKind::Unknown, |s| FileKind::from_ifmt(s)),
            mtime_ns: number("st_mtime")?,
            birthtime_ns: number("st_birthtime")?,
            link_target: raw.get("LinkTarget").cloned(),
            raw,
        })
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }
}
