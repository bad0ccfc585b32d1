//! AFC file-protocol client.
//!
//! One [`AfcClient`] owns one service channel. Methods take `&self` so a
//! client can be shared between threads: every request/response exchange
//! holds the channel lock for its whole duration, and the handle table has
//! its own lock. Operations that need several exchanges (relative seeks,
//! reads of "the rest of the file") are not atomic as a whole.
//!
//! Call [`AfcClient::close`] when done. It closes every handle still open,
//! then the channel, and is idempotent. Dropping an unclosed client does the
//! same but logs a warning.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use ilink_proto::afc::{
    self as wire, AfcStatus, FileInfo, LinkKind, Opcode, OpenMode, PacketHeader,
};
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::transport::ServiceStream;

struct Channel {
    stream: ServiceStream,
    packet_num: u64,
}

pub struct AfcClient {
    channel: Mutex<Option<Channel>>,
    handles: Mutex<HashMap<u64, String>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for AfcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AfcClient")
            .field("open_handles", &self.lock_handles().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AfcClient {
    pub fn new(stream: ServiceStream) -> Self {
        Self {
            channel: Mutex::new(Some(Channel {
                stream,
                packet_num: 0,
            })),
            handles: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send a raw request and return the reply data. Non-success statuses
    /// become [`ClientError::Afc`].
    pub fn request(&self, operation: Opcode, payload: &[u8]) -> Result<Vec<u8>> {
        self.exchange(operation, payload, None, None)
    }

    /// Device-wide key/value info (model, free space, block size...).
    pub fn device_info(&self) -> Result<BTreeMap<String, String>> {
        let data = self.exchange(Opcode::GetDevInfo, &[], None, None)?;
        Ok(wire::decode_key_values(&data)?)
    }

    /// Names in `path`, including `.` and `..`.
    pub fn listdir(&self, path: &str) -> Result<Vec<String>> {
        let data = self.exchange(Opcode::ReadDir, &wire::path_payload(path), None, Some(path))?;
        Ok(wire::decode_name_list(&data)?)
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        self.exchange(Opcode::MakeDir, &wire::path_payload(path), None, Some(path))
            .map(drop)
    }

    pub fn stat(&self, path: &str) -> Result<FileInfo> {
        let data = self.exchange(Opcode::GetFileInfo, &wire::path_payload(path), None, Some(path))?;
        Ok(FileInfo::from_map(wire::decode_key_values(&data)?)?)
    }

    pub fn readlink(&self, path: &str) -> Result<String> {
        let info = self.stat(path)?;
        if !info.is_symlink() {
            return Err(ClientError::InvalidArgument(format!(
                "{path} is not a symbolic link"
            )));
        }
        info.link_target
            .ok_or_else(|| ClientError::InvalidArgument(format!("{path} has no link target")))
    }

    /// Create `link_name` pointing at `target`.
    pub fn link(&self, kind: LinkKind, target: &str, link_name: &str) -> Result<()> {
        let payload = wire::link_payload(kind, target, link_name);
        self.exchange(Opcode::MakeLink, &payload, None, Some(link_name))
            .map(drop)
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        match self.exchange(Opcode::RemovePath, &wire::path_payload(path), None, Some(path)) {
            Ok(_) => Ok(()),
            Err(e) if e.is_transport() => Err(e),
            Err(e) => {
                if self.is_non_empty_dir(path) {
                    Err(ClientError::DirectoryNotEmpty(path.to_owned()))
                } else {
                    Err(e)
                }
            }
        }
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.exchange(Opcode::RenamePath, &wire::rename_payload(from, to), None, Some(from))
            .map(drop)
    }

    /// Set the modification time. Seconds are accepted and scaled to the
    /// nanoseconds the device stores.
    pub fn set_mtime(&self, path: &str, mtime: u64) -> Result<()> {
        self.exchange(Opcode::SetFileTime, &wire::set_mtime_payload(path, mtime), None, Some(path))
            .map(drop)
    }

    /// Raw digest bytes as computed by the device.
    pub fn file_hash(&self, path: &str) -> Result<Vec<u8>> {
        self.exchange(Opcode::GetFileHash, &wire::path_payload(path), None, Some(path))
    }

    /// `GET_SIZE_OF_PATH_CONTENTS`, returning the raw reply. Devices seen so
    /// far answer every such request with an error status.
    pub fn path_contents_size(&self, path: &str) -> Result<Vec<u8>> {
        self.exchange(Opcode::GetSizeOfPathContents, &wire::path_payload(path), None, Some(path))
    }

    // -----------------------------------------------------------------------
    // Handles
    // -----------------------------------------------------------------------

    pub fn open(&self, path: &str, mode: OpenMode) -> Result<u64> {
        let data = self.exchange(Opcode::FileOpen, &wire::open_payload(mode, path), None, Some(path))?;
        let handle = wire::decode_u64(&data)?;
        self.lock_handles().insert(handle, path.to_owned());
        debug!(handle, path, ?mode, "file opened");
        Ok(handle)
    }

    /// Close `handle`. Unknown handles are ignored.
    pub fn close_handle(&self, handle: u64) -> Result<()> {
        let Some(path) = self.lock_handles().remove(&handle) else {
            debug!(handle, "close of unknown handle ignored");
            return Ok(());
        };
        self.exchange(Opcode::FileClose, &wire::handle_payload(handle), None, Some(&path))
            .map(drop)
    }

    pub fn tell(&self, handle: u64) -> Result<u64> {
        let path = self.handle_path(handle)?;
        self.tell_at(handle, &path)
    }

    /// Move the file position and return the new absolute offset. Relative
    /// positions are resolved here against the current position or a fresh
    /// file size, and always sent as absolute offsets.
    pub fn seek(&self, handle: u64, pos: SeekFrom) -> Result<u64> {
        let path = self.handle_path(handle)?;
        let absolute = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => {
                let current = self.tell_at(handle, &path)?;
                let size = self.stat(&path)?.size;
                wire::resolve_from_current(current, delta, size)
                    .map_err(|e| ClientError::InvalidArgument(e.to_string()))?
            }
            SeekFrom::End(delta) => {
                let size = self.stat(&path)?.size;
                wire::resolve_from_end(size, delta)
                    .map_err(|e| ClientError::InvalidArgument(e.to_string()))?
            }
        };
        self.exchange(Opcode::FileSeek, &wire::seek_payload(handle, absolute), None, Some(&path))?;
        Ok(absolute)
    }

    /// Truncate or extend to `size`; `None` truncates at the current position.
    pub fn set_size(&self, handle: u64, size: Option<u64>) -> Result<()> {
        let path = self.handle_path(handle)?;
        let size = match size {
            Some(size) => size,
            None => self.tell_at(handle, &path)?,
        };
        self.exchange(
            Opcode::FileSetSize,
            &wire::handle_value_payload(handle, size),
            None,
            Some(&path),
        )
        .map(drop)
    }

    /// Read `size` bytes, or everything from the current position to the end
    /// when `None`. Requests past the end are clamped to the bytes left.
    pub fn read(&self, handle: u64, size: Option<u64>) -> Result<Vec<u8>> {
        let path = self.handle_path(handle)?;
        let total = self.stat(&path)?.size;
        let remaining = total.saturating_sub(self.tell_at(handle, &path)?);
        let wanted = size.map_or(remaining, |size| size.min(remaining));

        let mut out = Vec::with_capacity(wanted as usize);
        while (out.len() as u64) < wanted {
            let chunk = (wanted - out.len() as u64).min(wire::MAX_READ_SIZE as u64);
            let data = self.exchange(
                Opcode::Read,
                &wire::handle_value_payload(handle, chunk),
                None,
                Some(&path),
            )?;
            if data.is_empty() {
                break;
            }
            out.extend_from_slice(&data);
        }
        Ok(out)
    }

    /// Write `data` at the current position in chunks of at most 32 KiB.
    pub fn write(&self, handle: u64, data: &[u8]) -> Result<()> {
        let path = self.handle_path(handle)?;
        for chunk in data.chunks(wire::MAX_WRITE_SIZE) {
            let mut payload = Vec::with_capacity(8 + chunk.len());
            payload.extend_from_slice(&handle.to_le_bytes());
            payload.extend_from_slice(chunk);
            self.exchange(
                Opcode::Write,
                &payload,
                Some(wire::WRITE_THIS_LENGTH),
                Some(&path),
            )?;
        }
        Ok(())
    }

    /// Whole-file read. The handle is closed even when the read fails.
    pub fn read_path(&self, path: &str) -> Result<Vec<u8>> {
        let handle = self.open(path, OpenMode::ReadOnly)?;
        let result = self.read(handle, None);
        let closed = self.close_handle(handle);
        let data = result?;
        closed?;
        Ok(data)
    }

    /// Whole-file write, replacing any existing content. The handle is
    /// closed even when the write fails.
    pub fn write_path(&self, path: &str, data: &[u8]) -> Result<()> {
        let handle = self.open(path, OpenMode::WriteOnly)?;
        let result = self.write(handle, data);
        let closed = self.close_handle(handle);
        result?;
        closed
    }

    /// Close every open handle, then the channel. Handle close failures are
    /// logged, not returned. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let open: Vec<(u64, String)> = self.lock_handles().drain().collect();
        for (handle, path) in open {
            if let Err(e) = self.exchange(Opcode::FileClose, &wire::handle_payload(handle), None, Some(&path)) {
                warn!(handle, path = %path, error = %e, "failed to close handle during shutdown");
            }
        }

        if let Some(mut channel) = self.lock_channel().take() {
            channel.stream.close();
        }
        debug!("AFC client closed");
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn exchange(
        &self,
        operation: Opcode,
        payload: &[u8],
        this_length: Option<u64>,
        path: Option<&str>,
    ) -> Result<Vec<u8>> {
        let mut guard = self.lock_channel();
        let channel = guard.as_mut().ok_or(ClientError::Closed)?;

        match Self::roundtrip(channel, operation, payload, this_length) {
            Ok((status, data)) if status.is_success() => Ok(data),
            Ok((status, _)) => Err(status_error(operation, status, path)),
            Err(e) => {
                // A half-finished exchange leaves the stream out of step.
                if e.is_transport() {
                    if let Some(mut dead) = guard.take() {
                        dead.stream.close();
                    }
                }
                Err(e)
            }
        }
    }

    fn roundtrip(
        channel: &mut Channel,
        operation: Opcode,
        payload: &[u8],
        this_length: Option<u64>,
    ) -> Result<(AfcStatus, Vec<u8>)> {
        let header = PacketHeader::new(operation, channel.packet_num, payload.len(), this_length);
        channel.packet_num += 1;

        channel.stream.write_all(&header.encode())?;
        channel.stream.write_all(payload)?;
        channel.stream.flush()?;

        let mut head = [0u8; wire::HEADER_SIZE];
        channel.stream.read_exact(&mut head)?;
        let reply = PacketHeader::decode(&head)?;
        let mut data = vec![0u8; reply.payload_len()];
        channel.stream.read_exact(&mut data)?;

        let status = wire::status_from_reply(&reply, &data)?;
        if reply.operation == Opcode::Status {
            data.clear();
        }
        Ok((status, data))
    }

    fn tell_at(&self, handle: u64, path: &str) -> Result<u64> {
        let data = self.exchange(Opcode::FileTell, &wire::handle_payload(handle), None, Some(path))?;
        Ok(wire::decode_u64(&data)?)
    }

    fn handle_path(&self, handle: u64) -> Result<String> {
        self.lock_handles()
            .get(&handle)
            .cloned()
            .ok_or(ClientError::UnknownHandle(handle))
    }

    fn is_non_empty_dir(&self, path: &str) -> bool {
        match self.stat(path) {
            Ok(info) if info.is_dir() => self.listdir(path).is_ok_and(|names| names.len() > 2),
            _ => false,
        }
    }

    fn lock_channel(&self) -> MutexGuard<'_, Option<Channel>> {
        self.channel.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_handles(&self) -> MutexGuard<'_, HashMap<u64, String>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for AfcClient {
    fn drop(&mut self) {
        if !self.is_closed() {
            warn!("AfcClient dropped without close(); closing now");
            self.close();
        }
    }
}

fn status_error(operation: Opcode, status: AfcStatus, path: Option<&str>) -> ClientError {
    match (status, path) {
        (AfcStatus::ObjectNotFound, Some(path)) => ClientError::FileNotFound(path.to_owned()),
        _ => ClientError::afc(operation.name(), status, path),
    }
}
