//! GB28181 SIP proxy gateway.
//! Sits between video surveillance devices and an upstream GB28181 platform,
//! terminating both signaling legs on an ftth-rsipstack endpoint, rewriting
//! SDP so all media crosses its own TCP relay, and tracking device
//! registrations for the platform-initiated call path.

pub mod config;
pub mod error;
pub mod media;
pub mod registry;
pub mod sip;

pub use config::{DeviceConfig, ProxyConfig, SipProtocol};
pub use error::{Error, Result};
pub use registry::{DeviceInfo, DeviceRegistry};
pub use sip::{
    GbSipProxy, GbSipProxyBuilder, ProxyHandle, ProxyRuntime, RsipstackBackend, SipContext,
};

#[cfg(test)]
mod tests {
    use super::config::{DeviceConfig, ProxyConfig, SipProtocol};
    use super::sip::GbSipProxyBuilder;

    #[tokio::test]
    async fn build_proxy_runtime() {
        let config = ProxyConfig {
            server_ip: "127.0.0.1".parse().unwrap(),
            server_port: 15060,
            server_protocol: SipProtocol::Udp,
            client_ip: "127.0.0.1".parse().unwrap(),
            client_port: 15061,
            proxy_ip: "127.0.0.1".parse().unwrap(),
            proxy_sip_port: 15062,
            proxy_media_port: 25000,
            disable_proxy_udp: false,
            disable_proxy_tcp: false,
            devices: vec![DeviceConfig {
                sip_user: "34020000001320000001".into(),
                stream_port: 35000,
            }],
            user_agent: None,
        };

        let proxy = GbSipProxyBuilder::new(config)
            .build()
            .await
            .expect("build runtime");

        // We only test that the runtime can be started and shut down cleanly.
        let handle = proxy.start().await.expect("start proxy");
        handle.shutdown().await.expect("shutdown proxy");
    }

    #[tokio::test]
    async fn invite_for_unknown_device_is_rejected() {
        let config = ProxyConfig {
            server_ip: "127.0.0.1".parse().unwrap(),
            server_port: 16060,
            server_protocol: SipProtocol::Udp,
            client_ip: "127.0.0.1".parse().unwrap(),
            client_port: 16061,
            proxy_ip: "127.0.0.1".parse().unwrap(),
            proxy_sip_port: 16062,
            proxy_media_port: 26000,
            disable_proxy_udp: false,
            disable_proxy_tcp: false,
            devices: vec![DeviceConfig {
                sip_user: "34020000001320000001".into(),
                stream_port: 36000,
            }],
            user_agent: None,
        };

        let proxy = GbSipProxyBuilder::new(config)
            .build()
            .await
            .expect("build runtime");
        let handle = proxy.start().await.expect("start proxy");

        // Play the platform: an INVITE for an identifier that never
        // registered must bounce straight off the registry with a 400,
        // before any device-directed transaction is started.
        let probe = tokio::net::UdpSocket::bind("127.0.0.1:0")
            .await
            .expect("bind signaling socket");
        let invite = "INVITE sip:34020000009999999999@3402000000 SIP/2.0\r\n\
            Via: SIP/2.0/UDP 127.0.0.1:5060;rport;branch=z9hG4bKunknown1\r\n\
            From: <sip:34020000002000000001@3402000000>;tag=u1\r\n\
            To: <sip:34020000009999999999@3402000000>\r\n\
            Call-ID: unknown-1@127.0.0.1\r\n\
            CSeq: 1 INVITE\r\n\
            Contact: <sip:34020000002000000001@127.0.0.1:5060>\r\n\
            Max-Forwards: 70\r\n\
            Content-Length: 0\r\n\r\n";
        probe
            .send_to(invite.as_bytes(), "127.0.0.1:16061")
            .await
            .expect("send invite");

        let mut buf = vec![0u8; 2048];
        let (len, _) = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            probe.recv_from(&mut buf),
        )
        .await
        .expect("a reply within the deadline")
        .expect("receive reply");
        let reply = String::from_utf8_lossy(&buf[..len]);
        assert!(reply.starts_with("SIP/2.0 400"), "reply: {reply}");

        handle.shutdown().await.expect("shutdown proxy");
    }
}
