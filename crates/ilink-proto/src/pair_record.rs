//! Pairing record: the certificate and key bundle proving host/device trust.
//!
//! On disk and on the wire a record is a plist dictionary. Certificates and
//! keys are PEM bytes stored as `<data>` values; identifiers are strings.

use std::io::Cursor;

use plist::{Dictionary, Value};

use crate::error::{ProtoError, Result};

/// System BUID used when the host has no record of its own.
pub const DEFAULT_SYSTEM_BUID: &str = "30142955-444094379208051516";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PairRecord {
    pub device_public_key: Option<Vec<u8>>,
    pub device_certificate: Option<Vec<u8>>,
    pub host_certificate: Vec<u8>,
    pub host_private_key: Vec<u8>,
    pub root_certificate: Option<Vec<u8>>,
    pub root_private_key: Option<Vec<u8>>,
    pub host_id: Option<String>,
    pub system_buid: Option<String>,
    pub escrow_bag: Option<Vec<u8>>,
}

impl PairRecord {
    pub fn from_dictionary(dict: &Dictionary) -> Result<Self> {
        Ok(Self {
            device_public_key: data(dict, "DevicePublicKey"),
            device_certificate: data(dict, "DeviceCertificate"),
            host_certificate: data(dict, "HostCertificate")
                .ok_or(ProtoError::MissingField("HostCertificate"))?,
            host_private_key: data(dict, "HostPrivateKey")
                .ok_or(ProtoError::MissingField("HostPrivateKey"))?,
            root_certificate: data(dict, "RootCertificate"),
            root_private_key: data(dict, "RootPrivateKey"),
            host_id: string(dict, "HostID"),
            system_buid: string(dict, "SystemBUID"),
            escrow_bag: data(dict, "EscrowBag"),
        })
    }

    /// Full dictionary, private keys included. This is what gets persisted.
    pub fn to_dictionary(&self) -> Dictionary {
        let mut dict = self.pair_request_dictionary();
        dict.insert(
            "HostPrivateKey".into(),
            Value::Data(self.host_private_key.clone()),
        );
        if let Some(key) = &self.root_private_key {
            dict.insert("RootPrivateKey".into(), Value::Data(key.clone()));
        }
        if let Some(bag) = &self.escrow_bag {
            dict.insert("EscrowBag".into(), Value::Data(bag.clone()));
        }
        dict
    }

    /// The `PairRecord` sent with a `Pair` or `ValidatePair` request: no
    /// private keys, no escrow bag.
    pub fn pair_request_dictionary(&self) -> Dictionary {
        let mut dict = Dictionary::new();
        if let Some(key) = &self.device_public_key {
            dict.insert("DevicePublicKey".into(), Value::Data(key.clone()));
        }
        if let Some(cert) = &self.device_certificate {
            dict.insert("DeviceCertificate".into(), Value::Data(cert.clone()));
        }
        dict.insert(
            "HostCertificate".into(),
            Value::Data(self.host_certificate.clone()),
        );
        if let Some(cert) = &self.root_certificate {
            dict.insert("RootCertificate".into(), Value::Data(cert.clone()));
        }
        if let Some(id) = &self.host_id {
            dict.insert("HostID".into(), Value::String(id.clone()));
        }
        if let Some(buid) = &self.system_buid {
            dict.insert("SystemBUID".into(), Value::String(buid.clone()));
        }
        dict
    }

    /// Parse a record from binary or XML plist bytes.
    pub fn from_plist_bytes(bytes: &[u8]) -> Result<Self> {
        let value = Value::from_reader(Cursor::new(bytes))?;
        let dict = value
            .as_dictionary()
            .ok_or_else(|| ProtoError::Malformed("pairing record is not a dictionary".into()))?;
        Self::from_dictionary(dict)
    }

    pub fn to_plist_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        Value::Dictionary(self.to_dictionary()).to_writer_xml(&mut out)?;
        Ok(out)
    }

    /// Host certificate and private key concatenated, the form loaded for the
    /// TLS client identity.
    pub fn ssl_material_pem(&self) -> Vec<u8> {
        let mut pem = Vec::with_capacity(self.host_certificate.len() + self.host_private_key.len() + 1);
        pem.extend_from_slice(&self.host_certificate);
        pem.push(b'\n');
        pem.extend_from_slice(&self.host_private_key);
        pem
    }
}

fn data(dict: &Dictionary, key: &str) -> Option<Vec<u8>> {
    dict.get(key).and_then(Value::as_data).map(<[u8]>::to_vec)
}

fn string(dict: &Dictionary, key: &str) -> Option<String> {
    dict.get(key).and_then(Value::as_string).map(str::to_owned)
}
