//! Host and device identifiers.
//!
//! The host id (and the system BUID, when the host has no stored one) is a
//! name-based UUID of the machine's host name, upper-cased. Devices are keyed
//! by their UDID with dashes removed, or by the hex chip id when the device
//! reports no UDID.

use uuid::Uuid;

/// Name-based (v3, DNS namespace) UUID of `name`, upper-cased.
pub fn host_id_for(name: &str) -> String {
    Uuid::new_v3(&Uuid::NAMESPACE_DNS, name.as_bytes())
        .to_string()
        .to_uppercase()
}

/// Host id for the current machine. Falls back to `localhost` when the host
/// name cannot be read.
pub fn local_host_id() -> String {
    let name = hostname::get()
        .ok()
        .and_then(|n| n.into_string().ok())
        .unwrap_or_else(|| "localhost".to_owned());
    host_id_for(&name)
}

/// Strip the dashes newer devices put in their UDID.
pub fn normalize_udid(udid: &str) -> String {
    udid.replace('-', "")
}

/// Stable identifier used to key pairing records. `None` when the device
/// reported neither a UDID nor a chip id.
pub fn device_identifier(unique_device_id: Option<&str>, unique_chip_id: Option<u64>) -> Option<String> {
    match (unique_device_id, unique_chip_id) {
        (Some(udid), _) if !udid.is_empty() => Some(normalize_udid(udid)),
        (_, Some(chip)) => Some(format!("{chip:x}")),
        _ => None,
    }
}
