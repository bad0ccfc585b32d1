//! Connected device handle.
//!
//! [`Device`] ties discovery, a lockdown session and an AFC client together.
//! The caller owns it and passes it where needed; nothing is cached
//! process-wide.

use std::sync::Arc;

use ilink_proto::mux::MuxDevice;
use ilink_proto::version::ProductVersion;
use plist::{Dictionary, Value};
use tracing::{info, warn};

use crate::afc::AfcClient;
use crate::config::{AfcService, DiscoveryOptions, LockdownConfig};
use crate::error::Result;
use crate::lockdown::LockdownClient;
use crate::mux::{Connector, UsbMux};

pub struct Device {
    mux_device: MuxDevice,
    service: AfcService,
    lockdown: LockdownClient,
    afc: AfcClient,
    closed: bool,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("mux_device", &self.mux_device)
            .field("service", &self.service)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Find a device (by serial, or the first one attached) with default
    /// settings and open the standard AFC service on it.
    pub fn find(serial: Option<&str>) -> Result<Self> {
        let options = DiscoveryOptions {
            serial: serial.map(str::to_owned),
            ..DiscoveryOptions::default()
        };
        let config = LockdownConfig::with_address(options.address.clone());
        Self::find_with(options, config, AfcService::Standard)
    }

    pub fn find_with(options: DiscoveryOptions, config: LockdownConfig, service: AfcService) -> Result<Self> {
        let mut mux = UsbMux::connect(options.address.clone())?;
        let mux_device = mux.find_device(
            options.serial.as_deref(),
            options.poll_timeout,
            options.max_attempts,
        )?;
        let connector: Arc<dyn Connector> = Arc::new(mux.connector(&mux_device));
        Self::connect(mux_device, connector, config, service)
    }

    /// Bootstrap lockdown through `connector` and start `service`.
    pub fn connect(
        mux_device: MuxDevice,
        connector: Arc<dyn Connector>,
        config: LockdownConfig,
        service: AfcService,
    ) -> Result<Self> {
        let mut lockdown = LockdownClient::connect(connector, config)?;
        let stream = lockdown.start_service(service.service_name(), None)?;
        info!(serial = %mux_device.serial, service = service.service_name(), "device ready");
        Ok(Self {
            mux_device,
            service,
            lockdown,
            afc: AfcClient::new(stream),
            closed: false,
        })
    }

    pub fn afc(&self) -> &AfcClient {
        &self.afc
    }

    pub fn lockdown(&mut self) -> &mut LockdownClient {
        &mut self.lockdown
    }

    pub fn mux_device(&self) -> &MuxDevice {
        &self.mux_device
    }

    pub fn service(&self) -> AfcService {
        self.service
    }

    /// Device info read during the lockdown bootstrap.
    pub fn info(&self) -> &Dictionary {
        self.lockdown.device_info()
    }

    pub fn name(&self) -> Option<&str> {
        self.info().get("DeviceName").and_then(Value::as_string)
    }

    pub fn product_version(&self) -> Option<ProductVersion> {
        self.lockdown.product_version()
    }

    /// Close the AFC client, then the lockdown channel. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.afc.close();
        self.lockdown.close();
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if !self.closed {
            warn!(serial = %self.mux_device.serial, "Device dropped without close(); closing now");
            self.close();
        }
    }
}
