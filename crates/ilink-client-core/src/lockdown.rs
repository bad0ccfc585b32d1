//! Lockdown: pairing, sessions and service startup.
//!
//! [`LockdownClient::connect`] walks the whole bootstrap before returning:
//!
//! 1. open the lockdown port and check `QueryType`,
//! 2. read device info and derive the record identifier,
//! 3. look up a pairing record and start a session with it,
//! 4. if that fails, pair, reconnect and start a session with the new
//!    record.
//!
//! Any failure aborts construction; a half-initialised client is never
//! returned. Afterwards [`LockdownClient::start_service`] opens further
//! channels, upgraded to TLS when the device asks for it.

use std::io::Write;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ilink_proto::identity::{device_identifier, PairingCertificates};
use ilink_proto::pair_record::{PairRecord, DEFAULT_SYSTEM_BUID};
use ilink_proto::tls::build_device_tls_config;
use ilink_proto::version::ProductVersion;
use plist::{Dictionary, Value};
use rustls::ClientConfig;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::LockdownConfig;
use crate::error::{ClientError, Result};
use crate::mux::Connector;
use crate::plist_channel::PlistChannel;
use crate::transport::ServiceStream;

/// `Type` a genuine lockdownd reports for `QueryType`.
pub const LOCKDOWN_SERVICE_TYPE: &str = "com.apple.mobile.lockdown";

/// Escrow bag to present with `StartService`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscrowBag {
    /// Use the bag stored in the pairing record.
    FromRecord,
    Explicit(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    Unpaired,
    Paired,
    SessionStarted { session_id: String, ssl: bool },
}

/// Host identity on disk plus the TLS config built from it. The file is
/// removed when this is dropped.
struct SslMaterial {
    _file: NamedTempFile,
    config: Arc<ClientConfig>,
}

impl SslMaterial {
    fn create(record: &PairRecord, pin_device_certificate: bool) -> Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("ilink-ssl-")
            .suffix(".pem")
            .tempfile()?;
        file.write_all(&record.ssl_material_pem())?;
        file.flush()?;

        let pinned = if pin_device_certificate {
            record.device_certificate.as_deref()
        } else {
            None
        };
        let config = Arc::new(build_device_tls_config(file.path(), pinned)?);
        Ok(Self {
            _file: file,
            config,
        })
    }
}

pub struct LockdownClient {
    connector: Arc<dyn Connector>,
    config: LockdownConfig,
    channel: PlistChannel,
    device_info: Dictionary,
    identifier: String,
    product_version: Option<ProductVersion>,
    record: Option<PairRecord>,
    ssl: Option<SslMaterial>,
    state: SessionState,
}

impl std::fmt::Debug for LockdownClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockdownClient")
            .field("identifier", &self.identifier)
            .field("product_version", &self.product_version)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl LockdownClient {
    /// Bootstrap a session with the device behind `connector`, pairing first
    /// if no stored record is accepted.
    pub fn connect(connector: Arc<dyn Connector>, config: LockdownConfig) -> Result<Self> {
        let channel = open_channel(&*connector, &config)?;
        let mut client = Self {
            connector,
            config,
            channel,
            device_info: Dictionary::new(),
            identifier: String::new(),
            product_version: None,
            record: None,
            ssl: None,
            state: SessionState::Unpaired,
        };
        client.identify()?;

        if let Some(record) = client.lookup_record() {
            if client.start_session_with(record)? {
                return Ok(client);
            }
            info!(identifier = %client.identifier, "stored pairing record rejected, pairing again");
        } else {
            info!(identifier = %client.identifier, "no pairing record found, pairing");
        }

        let record = client.pair()?;
        client.channel.close();
        client.channel = open_channel(&*client.connector, &client.config)?;
        if !client.start_session_with(record)? {
            return Err(ClientError::FatalPairing(format!(
                "device {} rejected the record it just accepted",
                client.identifier
            )));
        }
        Ok(client)
    }

    /// Record identifier: normalized UDID, else hex chip id.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// All values from the device's default domain, read at connect time.
    pub fn device_info(&self) -> &Dictionary {
        &self.device_info
    }

    pub fn product_version(&self) -> Option<ProductVersion> {
        self.product_version
    }

    pub fn pair_record(&self) -> Option<&PairRecord> {
        self.record.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        match &self.state {
            SessionState::SessionStarted { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    pub fn is_session_ssl(&self) -> bool {
        matches!(self.state, SessionState::SessionStarted { ssl: true, .. })
    }

    /// Read a value. `Ok(None)` when the device has no such key.
    pub fn get_value(&mut self, domain: Option<&str>, key: Option<&str>) -> Result<Option<Value>> {
        let mut request = self.request_dict("GetValue");
        if let Some(domain) = domain {
            request.insert("Domain".into(), Value::String(domain.to_owned()));
        }
        if let Some(key) = key {
            request.insert("Key".into(), Value::String(key.to_owned()));
        }

        let reply = self.channel.request(&request)?;
        if let Some(error) = reply_error(&reply) {
            debug!(?domain, ?key, error, "GetValue returned no value");
        }
        Ok(reply.get("Value").cloned())
    }

    /// Write a value. Returns the device's reply.
    pub fn set_value(&mut self, value: Value, domain: Option<&str>, key: Option<&str>) -> Result<Dictionary> {
        let mut request = self.request_dict("SetValue");
        request.insert("Value".into(), value);
        if let Some(domain) = domain {
            request.insert("Domain".into(), Value::String(domain.to_owned()));
        }
        if let Some(key) = key {
            request.insert("Key".into(), Value::String(key.to_owned()));
        }

        let reply = self.channel.request(&request)?;
        if let Some(error) = reply_error(&reply) {
            return Err(ClientError::Lockdown {
                request: "SetValue",
                error: error.to_owned(),
            });
        }
        Ok(reply)
    }

    /// Start `name` and open a channel to it.
    pub fn start_service(&mut self, name: &str, escrow_bag: Option<EscrowBag>) -> Result<ServiceStream> {
        if self.state == SessionState::Unpaired {
            return Err(ClientError::NotPaired);
        }

        let mut request = self.request_dict("StartService");
        request.insert("Service".into(), Value::String(name.to_owned()));
        let bag = match escrow_bag {
            Some(EscrowBag::FromRecord) => self.record.as_ref().and_then(|r| r.escrow_bag.clone()),
            Some(EscrowBag::Explicit(bag)) => Some(bag),
            None => None,
        };
        if let Some(bag) = bag {
            request.insert("EscrowBag".into(), Value::Data(bag));
        }

        let reply = self.channel.request(&request).map_err(|e| match e {
            e if e.is_transport() => ClientError::StartService {
                service: name.to_owned(),
                reason: format!("no response: {e}"),
            },
            e => e,
        })?;

        match reply_error(&reply) {
            Some("PasswordProtected") => {
                return Err(ClientError::ServicePasswordProtected {
                    service: name.to_owned(),
                })
            }
            Some(error) => {
                return Err(ClientError::StartService {
                    service: name.to_owned(),
                    reason: error.to_owned(),
                })
            }
            None => {}
        }

        let port = reply
            .get("Port")
            .and_then(Value::as_unsigned_integer)
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| ClientError::StartService {
                service: name.to_owned(),
                reason: "reply carries no port".into(),
            })?;
        let service_ssl = reply
            .get("EnableServiceSSL")
            .and_then(Value::as_boolean)
            .unwrap_or(false);

        let mut stream = self.connector.connect(port)?;
        if service_ssl {
            let config = self.ssl_config()?;
            stream.upgrade_tls(config)?;
        }
        info!(service = name, port, ssl = service_ssl, "service started");
        Ok(stream)
    }

    /// End the current session. No-op when none is running.
    pub fn stop_session(&mut self) -> Result<()> {
        let SessionState::SessionStarted { session_id, .. } = &self.state else {
            return Ok(());
        };
        let mut request = self.request_dict("StopSession");
        request.insert("SessionID".into(), Value::String(session_id.clone()));
        self.state = SessionState::Paired;

        let reply = self.channel.request(&request)?;
        if reply.get("Result").and_then(Value::as_string) != Some("Success") {
            let reason = reply_error(&reply).unwrap_or("no Result=Success in reply");
            return Err(ClientError::CannotStopSession(reason.to_owned()));
        }
        debug!(identifier = %self.identifier, "session stopped");
        Ok(())
    }

    /// Reboot the device into recovery mode.
    pub fn enter_recovery(&mut self) -> Result<()> {
        let request = self.request_dict("EnterRecovery");
        let reply = self.channel.request(&request)?;
        if let Some(error) = reply_error(&reply) {
            return Err(ClientError::Lockdown {
                request: "EnterRecovery",
                error: error.to_owned(),
            });
        }
        info!(identifier = %self.identifier, "device entering recovery");
        Ok(())
    }

    pub fn close(&mut self) {
        self.channel.close();
    }

    fn request_dict(&self, request: &str) -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert("Label".into(), Value::String(self.config.label.clone()));
        dict.insert("Request".into(), Value::String(request.to_owned()));
        dict
    }

    fn identify(&mut self) -> Result<()> {
        self.device_info = match self.get_value(None, None)? {
            Some(Value::Dictionary(info)) => info,
            _ => return Err(ClientError::Initialization("device info unavailable".into())),
        };

        let udid = self.device_info.get("UniqueDeviceID").and_then(Value::as_string);
        let chip_id = self
            .device_info
            .get("UniqueChipID")
            .and_then(Value::as_unsigned_integer);
        self.identifier = device_identifier(udid, chip_id).ok_or_else(|| {
            ClientError::Initialization("device reports neither UniqueDeviceID nor UniqueChipID".into())
        })?;

        self.product_version = self
            .device_info
            .get("ProductVersion")
            .and_then(Value::as_string)
            .and_then(|v| match v.parse() {
                Ok(version) => Some(version),
                Err(e) => {
                    warn!(version = v, error = %e, "unparseable ProductVersion");
                    None
                }
            });
        debug!(identifier = %self.identifier, version = ?self.product_version, "device identified");
        Ok(())
    }

    fn lookup_record(&self) -> Option<PairRecord> {
        for store in &self.config.sources {
            match store.load(&self.identifier) {
                Ok(Some(record)) => {
                    info!(store = store.name(), identifier = %self.identifier, "using pairing record");
                    return Some(record);
                }
                Ok(None) => debug!(store = store.name(), "no pairing record"),
                Err(e) => warn!(store = store.name(), error = %e, "pairing record source failed"),
            }
        }
        None
    }

    /// `Ok(false)` when the device refuses the record; `Err` for anything
    /// that is not a verdict on the record.
    fn start_session_with(&mut self, record: PairRecord) -> Result<bool> {
        if self.product_version.is_some_and(ProductVersion::needs_validate_pair) {
            let mut request = self.request_dict("ValidatePair");
            request.insert(
                "PairRecord".into(),
                Value::Dictionary(record.pair_request_dictionary()),
            );
            let reply = self.channel.request(&request)?;
            if let Some(error) = reply_error(&reply) {
                warn!(error, "ValidatePair rejected");
                return Ok(false);
            }
        }

        let host_id = record
            .host_id
            .clone()
            .unwrap_or_else(|| self.config.host_id.clone());
        let system_buid = record
            .system_buid
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_BUID.to_owned());

        let mut request = self.request_dict("StartSession");
        request.insert("HostID".into(), Value::String(host_id));
        request.insert("SystemBUID".into(), Value::String(system_buid));
        let reply = self.channel.request(&request)?;
        if let Some(error) = reply_error(&reply) {
            warn!(error, "StartSession rejected");
            return Ok(false);
        }

        let session_id = reply
            .get("SessionID")
            .and_then(Value::as_string)
            .ok_or_else(|| ClientError::Initialization("StartSession reply without SessionID".into()))?
            .to_owned();
        let ssl = reply
            .get("EnableSessionSSL")
            .and_then(Value::as_boolean)
            .unwrap_or(false);

        self.record = Some(record);
        self.state = SessionState::Paired;
        if ssl {
            let config = self.ssl_config()?;
            self.channel.upgrade_tls(config)?;
            debug!("lockdown channel upgraded to TLS");
        }
        self.state = SessionState::SessionStarted { session_id, ssl };
        info!(identifier = %self.identifier, ssl, "session started");
        Ok(true)
    }

    fn pair(&mut self) -> Result<PairRecord> {
        let device_public_key = match self.get_value(None, Some("DevicePublicKey"))? {
            Some(Value::Data(key)) if !key.is_empty() => key,
            _ => return Err(ClientError::Pairing("cannot retrieve device public key".into())),
        };

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let certs = PairingCertificates::generate(&device_public_key, now)
            .map_err(|e| ClientError::Pairing(e.to_string()))?;

        let mut record = PairRecord {
            device_public_key: Some(device_public_key),
            device_certificate: Some(certs.device_certificate_pem.into_bytes()),
            host_certificate: certs.host_certificate_pem.into_bytes(),
            host_private_key: certs.host_private_key_pem.into_bytes(),
            root_certificate: Some(certs.root_certificate_pem.into_bytes()),
            root_private_key: Some(certs.root_private_key_pem.into_bytes()),
            host_id: Some(self.config.host_id.clone()),
            system_buid: Some(DEFAULT_SYSTEM_BUID.to_owned()),
            escrow_bag: None,
        };

        let mut request = self.request_dict("Pair");
        request.insert(
            "PairRecord".into(),
            Value::Dictionary(record.pair_request_dictionary()),
        );
        let reply = self.channel.request(&request)?;

        let escrow_bag = reply.get("EscrowBag").and_then(Value::as_data);
        let accepted = reply.get("Result").and_then(Value::as_string) == Some("Success");
        if !accepted && escrow_bag.is_none() {
            self.channel.close();
            return match reply_error(&reply) {
                Some("PasswordProtected") => Err(ClientError::NotTrusted),
                Some(error) => Err(ClientError::Pairing(error.to_owned())),
                None => Err(ClientError::Pairing("device gave no verdict".into())),
            };
        }

        record.escrow_bag = escrow_bag.map(<[u8]>::to_vec);
        if let Err(e) = self.config.cache.save(&self.identifier, &record) {
            warn!(store = self.config.cache.name(), error = %e, "could not persist new pairing record");
        }
        info!(identifier = %self.identifier, "paired");
        Ok(record)
    }

    fn ssl_config(&mut self) -> Result<Arc<ClientConfig>> {
        if let Some(ssl) = &self.ssl {
            return Ok(Arc::clone(&ssl.config));
        }
        let record = self.record.as_ref().ok_or(ClientError::NotPaired)?;
        let ssl = SslMaterial::create(record, self.config.pin_device_certificate)?;
        let config = Arc::clone(&ssl.config);
        self.ssl = Some(ssl);
        Ok(config)
    }
}

fn open_channel(connector: &dyn Connector, config: &LockdownConfig) -> Result<PlistChannel> {
    let mut channel = PlistChannel::new(connector.connect(config.port)?);

    let mut request = Dictionary::new();
    request.insert("Label".into(), Value::String(config.label.clone()));
    request.insert("Request".into(), Value::String("QueryType".into()));
    let reply = channel.request(&request)?;

    match reply.get("Type").and_then(Value::as_string) {
        Some(LOCKDOWN_SERVICE_TYPE) => Ok(channel),
        other => {
            channel.close();
            Err(ClientError::Initialization(format!(
                "expected {LOCKDOWN_SERVICE_TYPE}, device reported {other:?}"
            )))
        }
    }
}

fn reply_error(reply: &Dictionary) -> Option<&str> {
    reply.get("Error").and_then(Value::as_string)
}
