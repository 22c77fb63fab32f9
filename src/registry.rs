use std::collections::HashMap;

use ftth_rsipstack::rsip::transport::Transport;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::DeviceConfig;
use crate::error::{Error, Result};

/// Media destination learned from the most recent INVITE offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTarget {
    pub host: String,
    pub port: u16,
}

/// Runtime state of one registered device.
///
/// `host`/`port` are taken from the Via header of the first successful
/// REGISTER and are not refreshed afterwards. `media_server` is overwritten on
/// every proxied INVITE, so it always describes the latest call only.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: String,
    pub transport: Transport,
    pub host: String,
    pub port: u16,
    pub stream_port: u16,
    pub media_server: Option<MediaTarget>,
}

/// Shared device store. Entries are created by the device-facing leg on
/// registration and consulted by both signaling legs and the media relay;
/// nothing is ever removed for the lifetime of the process.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceInfo>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Reject device lists that reuse a stream port. Fatal at startup.
    pub fn validate(devices: &[DeviceConfig]) -> Result<()> {
        let mut seen: Vec<u16> = Vec::with_capacity(devices.len());
        for device in devices {
            if seen.contains(&device.stream_port) {
                return Err(Error::Configuration(format!(
                    "duplicate stream port {} (device {})",
                    device.stream_port, device.sip_user
                )));
            }
            seen.push(device.stream_port);
        }
        Ok(())
    }

    pub async fn lookup(&self, id: &str) -> Option<DeviceInfo> {
        self.devices.read().await.get(id).cloned()
    }

    /// Create the entry for `id`, or return the existing one unchanged.
    pub async fn register(
        &self,
        id: &str,
        transport: Transport,
        host: String,
        port: u16,
        stream_port: u16,
    ) -> DeviceInfo {
        let mut guard = self.devices.write().await;
        if let Some(existing) = guard.get(id) {
            return existing.clone();
        }
        let info = DeviceInfo {
            id: id.to_string(),
            transport,
            host,
            port,
            stream_port,
            media_server: None,
        };
        guard.insert(id.to_string(), info.clone());
        info!(
            device = id,
            %transport,
            source = %format!("{}:{}", info.host, info.port),
            "device registered"
        );
        info
    }

    /// Record the media server negotiated by the latest call. Returns false
    /// when the device was never registered.
    pub async fn update_media_server(&self, id: &str, host: String, port: u16) -> bool {
        let mut guard = self.devices.write().await;
        match guard.get_mut(id) {
            Some(info) => {
                info.media_server = Some(MediaTarget { host, port });
                true
            }
            None => false,
        }
    }
}
