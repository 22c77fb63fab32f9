use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::registry::{DeviceInfo, DeviceRegistry};

const LISTEN_RETRY_DELAY: Duration = Duration::from_secs(5);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP media splice between device connections and the media server
/// negotiated for the device's latest call.
///
/// Devices dial the proxy's media port; each accepted connection is matched to
/// a registered device by its source IP, then bridged to the media server the
/// answer SDP named, with the outbound side bound to the device's reserved
/// stream port.
#[derive(Debug)]
pub struct MediaRelay {
    config: Arc<ProxyConfig>,
    registry: Arc<DeviceRegistry>,
}

impl MediaRelay {
    pub fn new(config: Arc<ProxyConfig>, registry: Arc<DeviceRegistry>) -> Self {
        Self { config, registry }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let addr = self.config.proxy_media_addr();
        let listener = loop {
            info!(%addr, "starting media relay listener");
            tokio::select! {
                _ = cancel.cancelled() => return,
                bound = TcpListener::bind(addr) => match bound {
                    Ok(listener) => break listener,
                    Err(err) => {
                        warn!(%addr, error = %err, "media relay listen failed, retrying");
                        sleep(LISTEN_RETRY_DELAY).await;
                    }
                }
            }
        };
        info!(%addr, "media relay listening");

        loop {
            let (conn, peer) = tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "media relay accept error");
                        continue;
                    }
                }
            };

            let device = match self.match_device(peer.ip()).await {
                Some(device) => device,
                None => {
                    debug!(%peer, "media connection from unknown device, closing");
                    continue;
                }
            };

            info!(%peer, device = %device.id, "media connection accepted");
            let relay = self.clone();
            tokio::spawn(async move {
                relay.bridge(conn, peer, device).await;
            });
        }
    }

    /// Find the registered device whose signaling source matches the media
    /// connection's peer IP. Only configured devices are considered; a linear
    /// scan is fine for the device counts this proxy fronts.
    pub(crate) async fn match_device(&self, peer: IpAddr) -> Option<DeviceInfo> {
        let peer = peer.to_string();
        for entry in &self.config.devices {
            if let Some(info) = self.registry.lookup(&entry.sip_user).await {
                if info.host == peer {
                    return Some(info);
                }
            }
        }
        None
    }

    async fn bridge(&self, mut inbound: TcpStream, peer: SocketAddr, device: DeviceInfo) {
        let Some(target) = device.media_server.clone() else {
            warn!(device = %device.id, "no media server negotiated yet, closing");
            return;
        };

        let local = SocketAddr::new(self.config.client_ip, device.stream_port);
        let remote = format!("{}:{}", target.host, target.port);
        let mut outbound = match dial_from(local, &remote).await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(device = %device.id, %remote, error = %err, "media dial failed");
                return;
            }
        };

        info!(%peer, device = %device.id, %remote, "media splice started");
        match tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
            Ok((from_device, from_server)) => {
                info!(
                    %peer,
                    device = %device.id,
                    from_device,
                    from_server,
                    "media splice finished"
                );
            }
            Err(err) => {
                debug!(%peer, device = %device.id, error = %err, "media splice aborted");
            }
        }
    }
}

/// Dial `remote` with the local side bound to the device's stream port, so
/// outbound media is attributable (and firewall-permitted) per device.
async fn dial_from(local: SocketAddr, remote: &str) -> std::io::Result<TcpStream> {
    let remote: SocketAddr = remote
        .parse()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
    let socket = if local.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(local)?;
    timeout(DIAL_TIMEOUT, socket.connect(remote))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "media dial timed out"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, SipProtocol};
    use ftth_rsipstack::rsip::transport::Transport;

    fn test_config() -> ProxyConfig {
        ProxyConfig {
            server_ip: "10.1.0.2".parse().unwrap(),
            server_port: 5060,
            server_protocol: SipProtocol::Udp,
            client_ip: "10.1.0.10".parse().unwrap(),
            client_port: 5061,
            proxy_ip: "192.168.8.10".parse().unwrap(),
            proxy_sip_port: 5062,
            proxy_media_port: 20000,
            disable_proxy_udp: false,
            disable_proxy_tcp: false,
            devices: vec![
                DeviceConfig {
                    sip_user: "cam-1".into(),
                    stream_port: 30000,
                },
                DeviceConfig {
                    sip_user: "cam-2".into(),
                    stream_port: 30001,
                },
            ],
            user_agent: None,
        }
    }

    #[tokio::test]
    async fn matches_registered_device_by_source_ip() {
        let registry = Arc::new(DeviceRegistry::new());
        registry
            .register("cam-2", Transport::Udp, "192.168.8.22".into(), 5060, 30001)
            .await;
        let relay = MediaRelay::new(Arc::new(test_config()), registry);

        let hit = relay
            .match_device("192.168.8.22".parse().unwrap())
            .await
            .expect("registered device matches");
        assert_eq!(hit.id, "cam-2");
        assert_eq!(hit.stream_port, 30001);
    }

    #[tokio::test]
    async fn unknown_peer_is_rejected_before_dialing() {
        let registry = Arc::new(DeviceRegistry::new());
        registry
            .register("cam-1", Transport::Udp, "192.168.8.21".into(), 5060, 30000)
            .await;
        let relay = MediaRelay::new(Arc::new(test_config()), registry);

        assert!(
            relay
                .match_device("192.168.8.99".parse().unwrap())
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn unregistered_configured_device_does_not_match() {
        // cam-1 is configured but never registered; its IP must not match.
        let relay = MediaRelay::new(Arc::new(test_config()), Arc::new(DeviceRegistry::new()));
        assert!(
            relay
                .match_device("192.168.8.21".parse().unwrap())
                .await
                .is_none()
        );
    }
}
