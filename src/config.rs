use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Transport used when talking to the upstream platform.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SipProtocol {
    Udp,
    Tcp,
}

impl SipProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipProtocol::Udp => "udp",
            SipProtocol::Tcp => "tcp",
        }
    }
}

impl std::fmt::Display for SipProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static per-device entry. `stream_port` is the local port reserved for the
/// outbound media dial of this device; it must be unique across the list.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub sip_user: String,
    pub stream_port: u16,
}

/// Process-wide configuration, loaded once from a JSON file.
///
/// `server_*` is the upstream platform, `client_*` the proxy's platform-facing
/// SIP listener, `proxy_ip:proxy_sip_port` the device-facing SIP listener and
/// `proxy_ip:proxy_media_port` the media relay listener.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub server_ip: IpAddr,
    pub server_port: u16,
    pub server_protocol: SipProtocol,
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub proxy_ip: IpAddr,
    pub proxy_sip_port: u16,
    pub proxy_media_port: u16,
    #[serde(default)]
    pub disable_proxy_udp: bool,
    #[serde(default)]
    pub disable_proxy_tcp: bool,
    pub devices: Vec<DeviceConfig>,
    /// Optional User-Agent header override applied to all outbound SIP messages.
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl ProxyConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read(path.as_ref()).map_err(Error::Transport)?;
        serde_json::from_slice(&raw).map_err(Error::configuration)
    }

    pub fn server_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server_ip, self.server_port)
    }

    pub fn client_addr(&self) -> SocketAddr {
        SocketAddr::new(self.client_ip, self.client_port)
    }

    pub fn proxy_sip_addr(&self) -> SocketAddr {
        SocketAddr::new(self.proxy_ip, self.proxy_sip_port)
    }

    pub fn proxy_media_addr(&self) -> SocketAddr {
        SocketAddr::new(self.proxy_ip, self.proxy_media_port)
    }

    pub fn device(&self, sip_user: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|entry| entry.sip_user == sip_user)
    }

    pub fn resolved_user_agent(&self) -> String {
        self.user_agent
            .as_ref()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(|value| value.to_string())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_field_names() {
        let raw = r#"{
            "serverIp": "10.1.0.2",
            "serverPort": 5060,
            "serverProtocol": "udp",
            "clientIp": "10.1.0.10",
            "clientPort": 5061,
            "proxyIp": "192.168.8.10",
            "proxySipPort": 5062,
            "proxyMediaPort": 20000,
            "devices": [
                {"sipUser": "34020000001320000001", "streamPort": 30000},
                {"sipUser": "34020000001320000002", "streamPort": 30001}
            ]
        }"#;
        let config: ProxyConfig = serde_json::from_str(raw).expect("parse config");
        assert_eq!(config.server_protocol, SipProtocol::Udp);
        assert_eq!(config.proxy_sip_addr().to_string(), "192.168.8.10:5062");
        assert!(!config.disable_proxy_udp);
        assert!(!config.disable_proxy_tcp);
        assert_eq!(
            config.device("34020000001320000002").map(|d| d.stream_port),
            Some(30001)
        );
        assert!(config.device("34020000009999999999").is_none());
    }

    #[test]
    fn user_agent_defaults_to_crate_identity() {
        let raw = r#"{
            "serverIp": "10.1.0.2",
            "serverPort": 5060,
            "serverProtocol": "tcp",
            "clientIp": "10.1.0.10",
            "clientPort": 5061,
            "proxyIp": "192.168.8.10",
            "proxySipPort": 5062,
            "proxyMediaPort": 20000,
            "devices": []
        }"#;
        let config: ProxyConfig = serde_json::from_str(raw).expect("parse config");
        assert!(config.resolved_user_agent().starts_with("gb28181-proxy/"));
    }
}
