//! Blocking byte channels.
//!
//! [`MuxSocket`] is the control socket to usbmuxd. Once a connect request
//! succeeds the daemon relays raw bytes to the device port, and the socket is
//! wrapped in a [`ServiceStream`], which can be upgraded to TLS in place.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use ilink_proto::tls::device_server_name;
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use tracing::debug;

use crate::config::MuxAddress;
use crate::error::{ClientError, Result};

/// Anything a service channel can run over.
pub trait RawStream: Read + Write + Send {}

impl<T: Read + Write + Send> RawStream for T {}

/// Outcome of waiting for the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Readable,
    TimedOut,
}

/// Control connection to the usbmuxd daemon.
#[derive(Debug)]
pub enum MuxSocket {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl MuxSocket {
    pub fn connect(address: &MuxAddress) -> Result<Self> {
        match address {
            #[cfg(unix)]
            MuxAddress::Unix(path) => Ok(Self::Unix(UnixStream::connect(path)?)),
            #[cfg(not(unix))]
            MuxAddress::Unix(path) => Err(ClientError::Mux(format!(
                "Unix sockets are unavailable on this platform ({})",
                path.display()
            ))),
            MuxAddress::Tcp(addr) => {
                let stream = TcpStream::connect(addr)?;
                stream.set_nodelay(true)?;
                Ok(Self::Tcp(stream))
            }
        }
    }

    /// Block until the socket is readable or `timeout` passes. Error and
    /// invalid-descriptor conditions come back as `ConnectionAborted`.
    pub fn wait_readable(&self, timeout: Duration) -> io::Result<Readiness> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => poll_readable(std::os::fd::AsRawFd::as_raw_fd(s), timeout),
            #[cfg(unix)]
            Self::Tcp(s) => poll_readable(std::os::fd::AsRawFd::as_raw_fd(s), timeout),
            #[cfg(not(unix))]
            Self::Tcp(s) => peek_readable(s, timeout),
        }
    }

    pub fn shutdown(&self) {
        let result = match self {
            #[cfg(unix)]
            Self::Unix(s) => s.shutdown(std::net::Shutdown::Both),
            Self::Tcp(s) => s.shutdown(std::net::Shutdown::Both),
        };
        if let Err(e) = result {
            debug!(error = %e, "mux socket shutdown");
        }
    }
}

#[cfg(unix)]
fn poll_readable(fd: std::os::fd::RawFd, timeout: Duration) -> io::Result<Readiness> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    // SAFETY: `pfd` is a single valid pollfd that outlives the call.
    let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Readiness::TimedOut);
        }
        return Err(err);
    }
    if rc == 0 {
        return Ok(Readiness::TimedOut);
    }
    if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "exceptional condition on mux socket",
        ));
    }
    // POLLHUP counts as readable: the next read reports the EOF.
    Ok(Readiness::Readable)
}

#[cfg(not(unix))]
fn peek_readable(stream: &TcpStream, timeout: Duration) -> io::Result<Readiness> {
    stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
    let result = stream.peek(&mut [0u8; 1]);
    stream.set_read_timeout(None)?;
    match result {
        Ok(_) => Ok(Readiness::Readable),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            Ok(Readiness::TimedOut)
        }
        Err(e) => Err(e),
    }
}

impl Read for MuxSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => s.read(buf),
            Self::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for MuxSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => s.write(buf),
            Self::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => s.flush(),
            Self::Tcp(s) => s.flush(),
        }
    }
}

type TlsStream = StreamOwned<ClientConnection, Box<dyn RawStream>>;

enum StreamState {
    Plain(Box<dyn RawStream>),
    Tls(Box<TlsStream>),
    Closed,
}

/// An exclusive byte channel to one device port, plaintext or TLS.
pub struct ServiceStream {
    state: StreamState,
}

impl fmt::Debug for ServiceStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            StreamState::Plain(_) => "plain",
            StreamState::Tls(_) => "tls",
            StreamState::Closed => "closed",
        };
        f.debug_struct("ServiceStream").field("state", &state).finish()
    }
}

impl ServiceStream {
    pub fn new(raw: impl RawStream + 'static) -> Self {
        Self {
            state: StreamState::Plain(Box::new(raw)),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.state, StreamState::Tls(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, StreamState::Closed)
    }

    /// Run a TLS client handshake over the already-open channel. Subsequent
    /// reads and writes are encrypted.
    pub fn upgrade_tls(&mut self, config: Arc<ClientConfig>) -> Result<()> {
        match self.state {
            StreamState::Plain(_) => {}
            StreamState::Tls(_) => {
                return Err(ClientError::InvalidArgument("channel is already TLS".into()))
            }
            StreamState::Closed => return Err(ClientError::Closed),
        }
        let StreamState::Plain(mut raw) = std::mem::replace(&mut self.state, StreamState::Closed) else {
            return Err(ClientError::Closed);
        };

        let mut conn = ClientConnection::new(config, device_server_name())?;
        while conn.is_handshaking() {
            conn.complete_io(&mut raw).map_err(tls_io_error)?;
        }
        debug!(version = ?conn.protocol_version(), "TLS upgrade complete");

        self.state = StreamState::Tls(Box::new(StreamOwned::new(conn, raw)));
        Ok(())
    }

    /// Close the channel, sending a TLS close_notify first when encrypted.
    /// Closing twice is a no-op.
    pub fn close(&mut self) {
        if let StreamState::Tls(mut tls) = std::mem::replace(&mut self.state, StreamState::Closed) {
            tls.conn.send_close_notify();
            if let Err(e) = tls.conn.complete_io(&mut tls.sock) {
                debug!(error = %e, "close_notify not delivered");
            }
        }
    }
}

fn tls_io_error(e: io::Error) -> ClientError {
    if e.get_ref().is_some_and(|inner| inner.is::<rustls::Error>()) {
        if let Some(inner) = e.into_inner() {
            if let Ok(tls) = inner.downcast::<rustls::Error>() {
                return ClientError::Tls(*tls);
            }
        }
        return ClientError::ConnectionBroken;
    }
    e.into()
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "service stream is closed")
}

impl Read for ServiceStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.state {
            StreamState::Plain(s) => s.read(buf),
            StreamState::Tls(s) => s.read(buf),
            StreamState::Closed => Err(closed()),
        }
    }
}

impl Write for ServiceStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.state {
            StreamState::Plain(s) => s.write(buf),
            StreamState::Tls(s) => s.write(buf),
            StreamState::Closed => Err(closed()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.state {
            StreamState::Plain(s) => s.flush(),
            StreamState::Tls(s) => s.flush(),
            StreamState::Closed => Err(closed()),
        }
    }
}
