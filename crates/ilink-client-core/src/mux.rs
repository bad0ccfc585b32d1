//! usbmuxd client.
//!
//! A [`MuxConnection`] is one control socket to the daemon. It either stays
//! in control mode (listen for device events, read pairing records) or is
//! consumed by [`MuxConnection::connect`], after which the daemon relays raw
//! bytes to the device and the socket becomes a [`ServiceStream`]. Because
//! `connect` takes `self`, no control packet can follow it.
//!
//! [`UsbMux`] owns a listening connection, tracks the device set and hands
//! out fresh connections for device ports.

use std::io::{Read, Write};
use std::time::Duration;

use ilink_proto::error::ProtoError;
use ilink_proto::mux::{self as wire, MuxDevice, MuxHeader, MuxProtocol, MuxReply, MuxRequest};
use ilink_proto::pair_record::PairRecord;
use ilink_proto::store::PairRecordStore;
use tracing::{debug, info, warn};

use crate::config::MuxAddress;
use crate::error::{ClientError, Result};
use crate::transport::{MuxSocket, Readiness, ServiceStream};

/// Something that can open a raw channel to a port on one device.
pub trait Connector: Send + Sync {
    fn connect(&self, port: u16) -> Result<ServiceStream>;
}

/// One control socket to the daemon.
pub struct MuxConnection {
    socket: MuxSocket,
    protocol: MuxProtocol,
    tag: u32,
    devices: Vec<MuxDevice>,
    broken: bool,
}

impl MuxConnection {
    pub fn open(address: &MuxAddress, protocol: MuxProtocol) -> Result<Self> {
        Ok(Self::from_socket(MuxSocket::connect(address)?, protocol))
    }

    pub fn from_socket(socket: MuxSocket, protocol: MuxProtocol) -> Self {
        Self {
            socket,
            protocol,
            tag: 0,
            devices: Vec::new(),
            broken: false,
        }
    }

    pub fn protocol(&self) -> MuxProtocol {
        self.protocol
    }

    /// Devices announced so far, in arrival order.
    pub fn devices(&self) -> &[MuxDevice] {
        &self.devices
    }

    /// Subscribe to device add/remove events.
    pub fn listen(&mut self) -> Result<()> {
        match self.exchange(MuxRequest::Listen)? {
            MuxReply::Result(0) => Ok(()),
            MuxReply::Result(code) => Err(ClientError::Mux(format!("listen refused ({code})"))),
            other => Err(unexpected(&other)),
        }
    }

    /// Wait up to `timeout` for one packet and apply it to the device set.
    /// A timeout is not an error.
    pub fn process(&mut self, timeout: Duration) -> Result<()> {
        self.ensure_usable()?;
        match self.socket.wait_readable(timeout) {
            Ok(Readiness::TimedOut) => Ok(()),
            Ok(Readiness::Readable) => {
                let (header, reply) = self.read_packet()?;
                if !self.apply_event(&reply) {
                    debug!(tag = header.tag, ?reply, "ignoring unsolicited mux packet");
                }
                Ok(())
            }
            Err(e) => {
                self.mark_broken();
                Err(e.into())
            }
        }
    }

    /// Ask the daemon to relay this socket to `port` on the device. On
    /// success the connection is spent and the raw channel returned.
    pub fn connect(mut self, device_id: u32, port: u16) -> Result<ServiceStream> {
        match self.exchange(MuxRequest::Connect { device_id, port })? {
            MuxReply::Result(0) => {
                debug!(device_id, port, "mux connect established");
                Ok(ServiceStream::new(self.socket))
            }
            MuxReply::Result(code) => Err(ClientError::Mux(format!(
                "connect to device {device_id} port {port} refused ({code})"
            ))),
            other => Err(unexpected(&other)),
        }
    }

    /// Fetch the daemon's stored pairing record for `record_id` (the device
    /// UDID). Needs the plist dialect. `Ok(None)` when the daemon has none.
    pub fn read_pair_record(&mut self, record_id: &str) -> Result<Option<PairRecord>> {
        if self.protocol != MuxProtocol::Plist {
            return Err(ClientError::Mux(
                "ReadPairRecord requires the plist protocol".into(),
            ));
        }
        let request = MuxRequest::ReadPairRecord {
            record_id: record_id.to_owned(),
        };
        match self.exchange(request)? {
            MuxReply::PairRecord(bytes) => Ok(Some(PairRecord::from_plist_bytes(&bytes)?)),
            MuxReply::Result(code) => {
                debug!(record_id, code, "daemon has no pairing record");
                Ok(None)
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Send one request and wait for the reply carrying its tag. Device
    /// events that arrive first are applied on the way.
    fn exchange(&mut self, request: MuxRequest) -> Result<MuxReply> {
        self.ensure_usable()?;
        self.tag = self.tag.wrapping_add(1);
        let tag = self.tag;

        let packet = wire::encode_request(self.protocol, tag, &request)?;
        let sent = self
            .socket
            .write_all(&packet)
            .and_then(|()| self.socket.flush());
        if let Err(e) = sent {
            self.mark_broken();
            return Err(e.into());
        }

        loop {
            let (header, reply) = self.read_packet()?;
            if header.tag != tag && self.apply_event(&reply) {
                continue;
            }
            if header.tag != tag {
                return Err(ClientError::TagMismatch {
                    expected: tag,
                    actual: header.tag,
                });
            }
            return Ok(reply);
        }
    }

    fn read_packet(&mut self) -> Result<(MuxHeader, MuxReply)> {
        let mut head = [0u8; wire::HEADER_SIZE];
        if let Err(e) = self.socket.read_exact(&mut head) {
            self.mark_broken();
            return Err(e.into());
        }
        let header = match MuxHeader::decode(&head) {
            Ok(header) => header,
            Err(e) => {
                self.mark_broken();
                return Err(e.into());
            }
        };
        if header.version != self.protocol.version() {
            return Err(ClientError::VersionMismatch {
                expected: self.protocol.version(),
                actual: header.version,
            });
        }

        let mut payload = vec![0u8; header.payload_len()];
        if let Err(e) = self.socket.read_exact(&mut payload) {
            self.mark_broken();
            return Err(e.into());
        }
        let reply = wire::decode_reply(self.protocol, &header, &payload)?;
        Ok((header, reply))
    }

    /// Returns `false` when `reply` is not a device event.
    fn apply_event(&mut self, reply: &MuxReply) -> bool {
        match reply {
            MuxReply::Attached(device) => {
                info!(device_id = device.device_id, serial = %device.serial, "device attached");
                self.devices.retain(|d| d.device_id != device.device_id);
                self.devices.push(device.clone());
                true
            }
            MuxReply::Detached(device_id) => {
                info!(device_id, "device detached");
                self.devices.retain(|d| d.device_id != *device_id);
                true
            }
            MuxReply::Result(_) | MuxReply::PairRecord(_) => false,
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.broken {
            Err(ClientError::ConnectionBroken)
        } else {
            Ok(())
        }
    }

    fn mark_broken(&mut self) {
        self.broken = true;
        self.socket.shutdown();
    }
}

fn unexpected(reply: &MuxReply) -> ClientError {
    ClientError::Protocol(ProtoError::UnexpectedMessage(format!("{reply:?}")))
}

/// A listening daemon connection plus the address it came from.
pub struct UsbMux {
    address: MuxAddress,
    listener: MuxConnection,
}

impl UsbMux {
    /// Connect and start listening. Tries the binary protocol first and
    /// reconnects with the plist protocol if the daemon answers in it.
    pub fn connect(address: MuxAddress) -> Result<Self> {
        let mut listener = MuxConnection::open(&address, MuxProtocol::Binary)?;
        match listener.listen() {
            Ok(()) => {}
            Err(ClientError::VersionMismatch { actual, .. }) => {
                info!(daemon_version = actual, "usbmuxd speaks plist, reconnecting");
                listener = MuxConnection::open(&address, MuxProtocol::Plist)?;
                listener.listen()?;
            }
            Err(e) => return Err(e),
        }
        debug!(protocol = ?listener.protocol(), "listening for devices");
        Ok(Self { address, listener })
    }

    pub fn address(&self) -> &MuxAddress {
        &self.address
    }

    pub fn protocol(&self) -> MuxProtocol {
        self.listener.protocol()
    }

    pub fn devices(&self) -> &[MuxDevice] {
        self.listener.devices()
    }

    pub fn process(&mut self, timeout: Duration) -> Result<()> {
        self.listener.process(timeout)
    }

    /// Poll until at least one device is known, then pick one: the one
    /// matching `serial` when given, else the first.
    pub fn find_device(
        &mut self,
        serial: Option<&str>,
        timeout: Duration,
        max_attempts: u32,
    ) -> Result<MuxDevice> {
        for _ in 0..max_attempts {
            if !self.listener.devices().is_empty() {
                break;
            }
            self.listener.process(timeout)?;
        }

        let devices = self.listener.devices();
        let found = match serial {
            Some(serial) => devices.iter().find(|d| d.serial == serial),
            None => devices.first(),
        };
        match found {
            Some(device) => Ok(device.clone()),
            None => {
                warn!(serial = ?serial, known = devices.len(), "no matching device");
                Err(ClientError::DeviceNotFound(serial.map(str::to_owned)))
            }
        }
    }

    /// Open a fresh daemon connection relayed to `port` on `device`.
    pub fn connect_to(&self, device: &MuxDevice, port: u16) -> Result<ServiceStream> {
        MuxConnection::open(&self.address, self.protocol())?.connect(device.device_id, port)
    }

    /// A [`Connector`] bound to `device`.
    pub fn connector(&self, device: &MuxDevice) -> MuxConnector {
        MuxConnector {
            address: self.address.clone(),
            protocol: self.protocol(),
            device_id: device.device_id,
        }
    }
}

/// Opens device ports through the daemon, one fresh connection per call.
#[derive(Debug, Clone)]
pub struct MuxConnector {
    address: MuxAddress,
    protocol: MuxProtocol,
    device_id: u32,
}

impl MuxConnector {
    pub fn new(address: MuxAddress, protocol: MuxProtocol, device_id: u32) -> Self {
        Self {
            address,
            protocol,
            device_id,
        }
    }
}

impl Connector for MuxConnector {
    fn connect(&self, port: u16) -> Result<ServiceStream> {
        MuxConnection::open(&self.address, self.protocol)?.connect(self.device_id, port)
    }
}

/// The daemon's own pairing-record store, reached over a fresh plist
/// connection per lookup. Read-only.
#[derive(Debug, Clone)]
pub struct MuxPairRecordStore {
    address: MuxAddress,
}

impl MuxPairRecordStore {
    pub fn new(address: MuxAddress) -> Self {
        Self { address }
    }
}

impl PairRecordStore for MuxPairRecordStore {
    fn name(&self) -> &str {
        "usbmuxd"
    }

    fn load(&self, identifier: &str) -> ilink_proto::error::Result<Option<PairRecord>> {
        MuxConnection::open(&self.address, MuxProtocol::Plist)
            .and_then(|mut conn| conn.read_pair_record(identifier))
            .map_err(|e| ProtoError::StoreUnavailable(e.to_string()))
    }
}
