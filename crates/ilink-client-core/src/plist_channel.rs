//! Length-prefixed plist request/response channel.
//!
//! One outstanding request at a time: [`PlistChannel::request`] writes a
//! frame and blocks until the next frame arrives.

use std::io::{Read, Write};
use std::sync::Arc;

use ilink_proto::codec;
use plist::Dictionary;
use rustls::ClientConfig;
use tracing::trace;

use crate::error::Result;
use crate::transport::ServiceStream;

#[derive(Debug)]
pub struct PlistChannel {
    stream: ServiceStream,
}

impl PlistChannel {
    pub fn new(stream: ServiceStream) -> Self {
        Self { stream }
    }

    pub fn send(&mut self, message: &Dictionary) -> Result<()> {
        let frame = codec::encode_frame(message)?;
        trace!(bytes = frame.len(), "plist send");
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Block until one complete frame has arrived.
    pub fn recv(&mut self) -> Result<Dictionary> {
        let mut prefix = [0u8; codec::LENGTH_PREFIX_SIZE];
        self.stream.read_exact(&mut prefix)?;
        let len = codec::frame_length(prefix)?;

        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body)?;
        trace!(bytes = len, "plist recv");
        Ok(codec::decode_body(&body)?)
    }

    pub fn request(&mut self, message: &Dictionary) -> Result<Dictionary> {
        self.send(message)?;
        self.recv()
    }

    /// Switch the underlying stream to TLS; framing is unchanged.
    pub fn upgrade_tls(&mut self, config: Arc<ClientConfig>) -> Result<()> {
        self.stream.upgrade_tls(config)
    }

    pub fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    pub fn close(&mut self) {
        self.stream.close();
    }
}
