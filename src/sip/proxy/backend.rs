use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ftth_rsipstack::EndpointBuilder;
use ftth_rsipstack::rsip;
use ftth_rsipstack::transaction::Endpoint;
use ftth_rsipstack::transaction::endpoint::MessageInspector;
use ftth_rsipstack::transaction::key::{TransactionKey, TransactionRole};
use ftth_rsipstack::transaction::transaction::Transaction;
use ftth_rsipstack::transport::tcp_listener::TcpListenerConnection;
use ftth_rsipstack::transport::udp::{UdpConnection, UdpInner};
use ftth_rsipstack::transport::{SipAddr, SipConnection, TransportLayer};
use rsip::headers::ToTypedHeader;
use rsip::message::headers_ext::HeadersExt;
use rsip::transport::Transport;
use rsip::{Method, Param, Request, Response, SipMessage, StatusCode};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ProxyConfig, SipProtocol};
use crate::error::{Error, Result};
use crate::media::{MediaRelay, rewrite_sdp};
use crate::registry::DeviceInfo;

use super::builder::ShutdownSignal;
use super::state::SipContext;
use super::utils::{merge_headers, sip_addr_for, strip_rport_param};
use super::waiter::wait_answer;

const LISTEN_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct ProxyMessageInspector {
    user_agent: String,
}

impl ProxyMessageInspector {
    fn new(user_agent: String) -> Self {
        Self { user_agent }
    }

    fn apply_user_agent(headers: &mut rsip::headers::Headers, value: &str) {
        headers.retain(|header| {
            !matches!(header, rsip::Header::UserAgent(_))
                && !matches!(
                    header,
                    rsip::Header::Other(name, _) if name.eq_ignore_ascii_case("User-Agent")
                )
        });
        headers.push(rsip::Header::UserAgent(rsip::headers::UserAgent::from(
            value.to_string(),
        )));
    }
}

impl MessageInspector for ProxyMessageInspector {
    fn before_send(&self, msg: SipMessage) -> SipMessage {
        match msg {
            SipMessage::Request(mut req) => {
                if let Ok(via) = req.via_header_mut()
                    && let Ok(mut typed) = via.clone().typed()
                {
                    strip_rport_param(&mut typed);
                    *via = typed.into();
                }
                Self::apply_user_agent(&mut req.headers, &self.user_agent);
                SipMessage::Request(req)
            }
            SipMessage::Response(mut res) => {
                Self::apply_user_agent(&mut res.headers, &self.user_agent);
                SipMessage::Response(res)
            }
        }
    }

    fn after_received(&self, msg: SipMessage) -> SipMessage {
        msg
    }
}

#[async_trait(?Send)]
pub trait SipBackend: Send + Sync + 'static {
    async fn initialize(&self, context: &SipContext) -> Result<()>;

    async fn run(&self, context: SipContext, shutdown: &mut ShutdownSignal) -> Result<()>;

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct RsipstackBackend {
    inner: Arc<BackendInner>,
}

struct BackendInner {
    endpoint: RwLock<Option<Arc<Endpoint>>>,
    transport_cancel: RwLock<CancellationToken>,
    device_transport: RwLock<Option<SipConnection>>,
    platform_transport: RwLock<Option<SipConnection>>,
}

impl Default for RsipstackBackend {
    fn default() -> Self {
        Self {
            inner: Arc::new(BackendInner {
                endpoint: RwLock::new(None),
                transport_cancel: RwLock::new(CancellationToken::new()),
                device_transport: RwLock::new(None),
                platform_transport: RwLock::new(None),
            }),
        }
    }
}

#[async_trait(?Send)]
impl SipBackend for RsipstackBackend {
    async fn initialize(&self, context: &SipContext) -> Result<()> {
        let config = context.config.as_ref();
        info!(
            device_leg = %config.proxy_sip_addr(),
            platform_leg = %config.client_addr(),
            platform = %config.server_addr(),
            "initializing sip backend"
        );

        if config.disable_proxy_udp && config.disable_proxy_tcp {
            return Err(Error::configuration(
                "both device-leg transports are disabled",
            ));
        }

        let cancel = CancellationToken::new();
        let transport_layer = TransportLayer::new(cancel.clone());

        if !config.disable_proxy_udp {
            let conn = bind_udp_listener(config.proxy_sip_addr(), &cancel).await;
            let transport: SipConnection = conn.into();
            transport_layer.add_transport(transport.clone());
            self.inner.device_transport.write().await.replace(transport);
        }
        if !config.disable_proxy_tcp {
            let transport = bind_tcp_listener(config.proxy_sip_addr()).await?;
            transport_layer.add_transport(transport);
        }

        match config.server_protocol {
            SipProtocol::Udp => {
                let conn = bind_udp_listener(config.client_addr(), &cancel).await;
                let transport: SipConnection = conn.into();
                transport_layer.add_transport(transport.clone());
                self.inner
                    .platform_transport
                    .write()
                    .await
                    .replace(transport);
            }
            SipProtocol::Tcp => {
                let transport = bind_tcp_listener(config.client_addr()).await?;
                transport_layer.add_transport(transport);
            }
        }

        let mut endpoint_builder = EndpointBuilder::new();
        endpoint_builder
            .with_cancel_token(cancel.clone())
            .with_transport_layer(transport_layer)
            .with_inspector(Box::new(ProxyMessageInspector::new(
                config.resolved_user_agent(),
            )));
        let endpoint = Arc::new(endpoint_builder.build());

        self.inner.endpoint.write().await.replace(endpoint);
        *self.inner.transport_cancel.write().await = cancel;

        Ok(())
    }

    async fn run(&self, context: SipContext, shutdown: &mut ShutdownSignal) -> Result<()> {
        let endpoint = self.endpoint().await?;
        let device_listener = context.config.proxy_sip_addr();
        let platform_listener = context.config.client_addr();

        let mut incoming = endpoint.incoming_transactions().map_err(Error::sip_stack)?;
        let endpoint_task = endpoint.serve();
        tokio::pin!(endpoint_task);

        let media_cancel = CancellationToken::new();
        let media = Arc::new(MediaRelay::new(
            context.config.clone(),
            context.registry.clone(),
        ));
        let media_handle = tokio::spawn(media.run(media_cancel.clone()));

        info!("sip event loop started");
        loop {
            let mut exit_after_iteration = false;

            tokio::select! {
                _ = shutdown.recv() => {
                    endpoint.shutdown();
                    exit_after_iteration = true;
                }
                _ = &mut endpoint_task => {
                    warn!("endpoint serve loop exited");
                    exit_after_iteration = true;
                }
                maybe_tx = incoming.recv() => {
                    match maybe_tx {
                        Some(tx) => {
                            let backend = self.clone();
                            let context_clone = context.clone();
                            tokio::spawn(async move {
                                if let Err(err) = backend
                                    .process_transaction(
                                        context_clone,
                                        tx,
                                        device_listener,
                                        platform_listener,
                                    )
                                    .await
                                {
                                    warn!(error = %err, "failed to process transaction");
                                }
                            });
                        }
                        None => {
                            warn!("transaction stream terminated");
                            exit_after_iteration = true;
                        }
                    }
                }
            }

            if exit_after_iteration {
                break;
            }
        }

        media_cancel.cancel();
        if let Err(join_err) = media_handle.await {
            error!(error = %join_err, "media relay task failed");
        }

        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        info!("sip backend shutting down");
        if let Some(endpoint) = self.inner.endpoint.write().await.take() {
            endpoint.shutdown();
        }
        self.inner.transport_cancel.write().await.cancel();
        self.inner.device_transport.write().await.take();
        self.inner.platform_transport.write().await.take();
        Ok(())
    }
}

impl RsipstackBackend {
    async fn endpoint(&self) -> Result<Arc<Endpoint>> {
        let guard = self.inner.endpoint.read().await;
        guard
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::configuration("endpoint not initialized"))
    }

    async fn cancel_token(&self) -> CancellationToken {
        self.inner.transport_cancel.read().await.clone()
    }

    async fn process_transaction(
        &self,
        context: SipContext,
        mut tx: Transaction,
        device_listener: SocketAddr,
        platform_listener: SocketAddr,
    ) -> Result<()> {
        let direction = determine_direction(
            &tx,
            device_listener,
            platform_listener,
            context.config.server_addr(),
        )?;
        debug!(method = %tx.original.method, ?direction, "processing transaction");

        match (tx.original.method.clone(), direction) {
            (Method::Register, TransactionDirection::Device) => {
                self.handle_register(context, &mut tx).await
            }
            (Method::Message, TransactionDirection::Device) => {
                self.handle_device_message(context, &mut tx).await
            }
            (Method::Bye, TransactionDirection::Device) => {
                self.handle_device_bye(context, &mut tx).await
            }
            (Method::Ack, _) => {
                debug!(?direction, "ACK absorbed");
                Ok(())
            }
            (Method::Invite, TransactionDirection::Platform) => {
                self.handle_invite(context, &mut tx).await
            }
            (Method::Message, TransactionDirection::Platform)
            | (Method::Subscribe, TransactionDirection::Platform) => {
                self.handle_platform_request(context, &mut tx).await
            }
            (Method::Bye, TransactionDirection::Platform) => {
                self.handle_platform_bye(context, &mut tx).await
            }
            (method, _) => {
                debug!(%method, ?direction, "method not handled on this leg");
                tx.reply(StatusCode::MethodNotAllowed)
                    .await
                    .map_err(Error::sip_stack)?;
                Ok(())
            }
        }
    }

    /// REGISTER from a device: forward to the platform and, on 200, learn the
    /// device's signaling source from its own Via so later platform-initiated
    /// requests can reach it.
    async fn handle_register(&self, context: SipContext, tx: &mut Transaction) -> Result<()> {
        let Some(user) = from_user(&tx.original) else {
            tx.reply(StatusCode::BadRequest)
                .await
                .map_err(Error::sip_stack)?;
            return Ok(());
        };
        let Some(entry) = context.config.device(&user).cloned() else {
            warn!(user, "REGISTER from unconfigured device");
            tx.reply(StatusCode::BadRequest)
                .await
                .map_err(Error::sip_stack)?;
            return Ok(());
        };

        let (request, target) = match to_platform_request(&context.config, &tx.original) {
            Ok(forwarded) => forwarded,
            Err(err) => {
                warn!(user, error = %err, "REGISTER rewrite failed");
                tx.reply(StatusCode::BadRequest)
                    .await
                    .map_err(Error::sip_stack)?;
                return Ok(());
            }
        };

        let endpoint = self.endpoint().await?;
        let cancel = self.cancel_token().await;
        let mut upstream = match self
            .start_client_transaction(endpoint, request, target, ClientTarget::Platform)
            .await
        {
            Ok(upstream) => upstream,
            Err(err) => {
                warn!(user, error = %err, "REGISTER forward failed");
                tx.reply(StatusCode::ServerInternalError)
                    .await
                    .map_err(Error::sip_stack)?;
                return Ok(());
            }
        };

        let response = match wait_answer(&cancel, &mut upstream).await {
            Ok(response) => response,
            Err(Error::Cancelled) => return Ok(()),
            Err(err) => {
                warn!(user, error = %err, "no REGISTER answer from platform");
                tx.reply(StatusCode::ServerInternalError)
                    .await
                    .map_err(Error::sip_stack)?;
                return Ok(());
            }
        };

        if response.status_code == StatusCode::OK {
            let via = tx.original.via_header().map_err(Error::sip_stack)?;
            let (host, port) = device_source_from_via(via)?;
            let transport = tx
                .connection
                .as_ref()
                .and_then(|conn| conn.get_addr().r#type)
                .unwrap_or(Transport::Udp);
            context
                .registry
                .register(&user, transport, host, port, entry.stream_port)
                .await;
        }
        info!(user, status = %response.status_code, "REGISTER relayed");

        relay_merged(tx, &response).await
    }

    /// MESSAGE from a device (keepalives, catalog answers). Requires a prior
    /// registration so the platform already knows the identity.
    async fn handle_device_message(&self, context: SipContext, tx: &mut Transaction) -> Result<()> {
        let Some(user) = from_user(&tx.original) else {
            tx.reply(StatusCode::BadRequest)
                .await
                .map_err(Error::sip_stack)?;
            return Ok(());
        };
        if context.config.device(&user).is_none() {
            warn!(user, "MESSAGE from unconfigured device");
            tx.reply(StatusCode::BadRequest)
                .await
                .map_err(Error::sip_stack)?;
            return Ok(());
        }
        if context.registry.lookup(&user).await.is_none() {
            warn!(user, "MESSAGE from unregistered device");
            tx.reply(StatusCode::Unauthorized)
                .await
                .map_err(Error::sip_stack)?;
            return Ok(());
        }

        let (request, target) = match to_platform_request(&context.config, &tx.original) {
            Ok(forwarded) => forwarded,
            Err(err) => {
                warn!(user, error = %err, "MESSAGE rewrite failed");
                tx.reply(StatusCode::BadRequest)
                    .await
                    .map_err(Error::sip_stack)?;
                return Ok(());
            }
        };

        match self
            .forward_and_wait(request, target, ClientTarget::Platform)
            .await
        {
            Ok(response) => relay_merged(tx, &response).await,
            Err(Error::Cancelled) => Ok(()),
            Err(err) => {
                warn!(user, error = %err, "MESSAGE forward failed");
                tx.reply(StatusCode::ServerInternalError)
                    .await
                    .map_err(Error::sip_stack)?;
                Ok(())
            }
        }
    }

    /// BYE from a device. Forward failures are only logged; the device's
    /// transaction then times out on its own.
    async fn handle_device_bye(&self, context: SipContext, tx: &mut Transaction) -> Result<()> {
        let (request, target) = match to_platform_request(&context.config, &tx.original) {
            Ok(forwarded) => forwarded,
            Err(err) => {
                warn!(error = %err, "BYE rewrite failed");
                return Ok(());
            }
        };

        match self
            .forward_and_wait(request, target, ClientTarget::Platform)
            .await
        {
            Ok(response) => relay_merged(tx, &response).await,
            Err(err) => {
                warn!(error = %err, "BYE forward failed");
                Ok(())
            }
        }
    }

    /// MESSAGE and SUBSCRIBE from the platform (device control, catalog
    /// queries). The recipient user names the target device; the device's
    /// answer is relayed back with its headers merged.
    async fn handle_platform_request(
        &self,
        context: SipContext,
        tx: &mut Transaction,
    ) -> Result<()> {
        let Some(device) = self.lookup_recipient(&context, tx).await? else {
            return Ok(());
        };
        let (request, target) = match to_device_request(&context.config, &tx.original, &device) {
            Ok(forwarded) => forwarded,
            Err(err) => {
                warn!(device = %device.id, error = %err, "request rewrite failed");
                tx.reply(StatusCode::BadRequest)
                    .await
                    .map_err(Error::sip_stack)?;
                return Ok(());
            }
        };

        match self
            .forward_and_wait(request, target, ClientTarget::Device)
            .await
        {
            Ok(response) => relay_merged(tx, &response).await,
            Err(Error::Cancelled) => Ok(()),
            Err(err) => {
                warn!(device = %device.id, error = %err, "forward failed");
                tx.reply(StatusCode::ServerInternalError)
                    .await
                    .map_err(Error::sip_stack)?;
                Ok(())
            }
        }
    }

    /// BYE from the platform, ending the device's dialog. Same relay as
    /// MESSAGE, except a forward failure is only logged; the platform's
    /// transaction times out on its own.
    async fn handle_platform_bye(&self, context: SipContext, tx: &mut Transaction) -> Result<()> {
        let Some(device) = self.lookup_recipient(&context, tx).await? else {
            return Ok(());
        };
        let (request, target) = match to_device_request(&context.config, &tx.original, &device) {
            Ok(forwarded) => forwarded,
            Err(err) => {
                warn!(device = %device.id, error = %err, "BYE rewrite failed");
                tx.reply(StatusCode::BadRequest)
                    .await
                    .map_err(Error::sip_stack)?;
                return Ok(());
            }
        };

        match self
            .forward_and_wait(request, target, ClientTarget::Device)
            .await
        {
            Ok(response) => relay_merged(tx, &response).await,
            Err(err) => {
                warn!(device = %device.id, error = %err, "BYE forward failed");
                Ok(())
            }
        }
    }

    /// INVITE from the platform. Both SDP halves are rewritten so all media
    /// flows through the relay: the offer is pointed at the proxy's media
    /// port (remembering the platform's real media address), the answer at
    /// the platform-facing IP and the device's reserved stream port.
    async fn handle_invite(&self, context: SipContext, tx: &mut Transaction) -> Result<()> {
        let Some(device) = self.lookup_recipient(&context, tx).await? else {
            return Ok(());
        };
        let config = context.config.as_ref();

        let (mut request, target) = match to_device_request(config, &tx.original, &device) {
            Ok(forwarded) => forwarded,
            Err(err) => {
                warn!(device = %device.id, error = %err, "INVITE rewrite failed");
                tx.reply(StatusCode::BadRequest)
                    .await
                    .map_err(Error::sip_stack)?;
                return Ok(());
            }
        };

        if !request.body.is_empty() {
            let offer = String::from_utf8_lossy(&request.body).into_owned();
            let rewrite = rewrite_sdp(
                &offer,
                &config.proxy_ip.to_string(),
                config.proxy_media_port,
            );
            if let Some(media_host) = rewrite.media_host.clone() {
                debug!(
                    device = %device.id,
                    media_server = %format!("{}:{}", media_host, rewrite.media_port),
                    "platform media address captured"
                );
                context
                    .registry
                    .update_media_server(&device.id, media_host, rewrite.media_port)
                    .await;
            }
            request.body = rewrite.sdp.into_bytes();
            let content_length = request.body.len() as u32;
            request.headers.unique_push(rsip::Header::ContentLength(
                rsip::headers::ContentLength::from(content_length),
            ));
        }

        let endpoint = self.endpoint().await?;
        let cancel = self.cancel_token().await;
        let mut downstream = match self
            .start_client_transaction(
                endpoint,
                request.clone(),
                target.clone(),
                ClientTarget::Device,
            )
            .await
        {
            Ok(downstream) => downstream,
            Err(err) => {
                warn!(device = %device.id, error = %err, "INVITE forward failed");
                tx.reply(StatusCode::ServerInternalError)
                    .await
                    .map_err(Error::sip_stack)?;
                return Ok(());
            }
        };

        let response = match wait_answer(&cancel, &mut downstream).await {
            Ok(response) => response,
            Err(Error::Cancelled) => return Ok(()),
            Err(err) => {
                warn!(device = %device.id, error = %err, "no INVITE answer from device");
                tx.reply(StatusCode::ServerInternalError)
                    .await
                    .map_err(Error::sip_stack)?;
                return Ok(());
            }
        };
        drop(downstream);

        let body = if response.body.is_empty() {
            None
        } else {
            let answer = String::from_utf8_lossy(&response.body).into_owned();
            // The device's own media address in the answer is irrelevant: the
            // relay accepts its inbound stream and dials the platform itself.
            let rewrite = rewrite_sdp(&answer, &config.client_ip.to_string(), device.stream_port);
            Some(rewrite.sdp.into_bytes())
        };
        info!(
            device = %device.id,
            status = %response.status_code,
            "INVITE answer relayed"
        );
        tx.reply_with(response.status_code.clone(), Vec::new(), body)
            .await
            .map_err(Error::sip_stack)?;

        // The platform's ACK ends on the proxy, so the device leg needs its
        // own. It reuses the forwarded INVITE's headers wholesale.
        if let Err(err) = self.send_ack(&request, &target).await {
            warn!(device = %device.id, error = %err, "failed to send ACK to device");
        }
        Ok(())
    }

    async fn lookup_recipient(
        &self,
        context: &SipContext,
        tx: &mut Transaction,
    ) -> Result<Option<DeviceInfo>> {
        let user = tx
            .original
            .uri
            .auth
            .as_ref()
            .map(|auth| auth.user.clone())
            .unwrap_or_default();
        match context.registry.lookup(&user).await {
            Some(device) => Ok(Some(device)),
            None => {
                warn!(user, "request for unknown device");
                tx.reply(StatusCode::BadRequest)
                    .await
                    .map_err(Error::sip_stack)?;
                Ok(None)
            }
        }
    }

    async fn forward_and_wait(
        &self,
        request: Request,
        target: SipAddr,
        binding: ClientTarget,
    ) -> Result<Response> {
        let endpoint = self.endpoint().await?;
        let cancel = self.cancel_token().await;
        let mut upstream = self
            .start_client_transaction(endpoint, request, target, binding)
            .await?;
        wait_answer(&cancel, &mut upstream).await
    }

    async fn start_client_transaction(
        &self,
        endpoint: Arc<Endpoint>,
        request: Request,
        target: SipAddr,
        binding: ClientTarget,
    ) -> Result<Transaction> {
        let key = TransactionKey::from_request(&request, TransactionRole::Client)
            .map_err(Error::sip_stack)?;
        // Datagram sends must leave through the leg's own listener socket so
        // the peer sees the configured source address.
        let connection = if target.r#type == Some(Transport::Udp) {
            match binding {
                ClientTarget::Platform => self.inner.platform_transport.read().await.clone(),
                ClientTarget::Device => self.inner.device_transport.read().await.clone(),
            }
        } else {
            None
        };

        let mut tx = Transaction::new_client(key, request, endpoint.inner.clone(), connection);
        tx.destination = Some(target);
        tx.send().await.map_err(Error::sip_stack)?;
        Ok(tx)
    }

    /// Fire-and-forget ACK on the device leg, outside any transaction.
    async fn send_ack(&self, request: &Request, target: &SipAddr) -> Result<()> {
        let ack = ack_for(request);

        let connection = self.inner.device_transport.read().await.clone();
        match connection {
            Some(conn) if target.r#type == Some(Transport::Udp) => conn
                .send(SipMessage::Request(ack), Some(target))
                .await
                .map_err(Error::sip_stack),
            _ => Err(Error::sip_stack(format!(
                "no device-leg datagram transport for ACK to {target}"
            ))),
        }
    }
}

/// The ACK reuses the forwarded INVITE's headers (branch and CSeq included)
/// but carries no body; the offer must not ride along into the ACK.
fn ack_for(request: &Request) -> Request {
    let mut ack = request.clone();
    ack.method = Method::Ack;
    ack.body = Vec::new();
    ack.headers.unique_push(rsip::Header::ContentLength(
        rsip::headers::ContentLength::from(0u32),
    ));
    ack
}

fn determine_direction(
    tx: &Transaction,
    device_listener: SocketAddr,
    platform_listener: SocketAddr,
    platform_addr: SocketAddr,
) -> Result<TransactionDirection> {
    let connection = tx
        .connection
        .as_ref()
        .ok_or_else(|| Error::sip_stack("transaction missing transport connection"))?;
    classify_source(
        connection.get_addr(),
        device_listener,
        platform_listener,
        platform_addr,
    )
}

/// Datagram transactions carry the listener's own address, so they match a
/// leg by local address. Accepted stream connections are labeled with the
/// peer's address instead; only the platform dials in over TCP from its
/// configured IP, so those classify by peer.
fn classify_source(
    addr: &SipAddr,
    device_listener: SocketAddr,
    platform_listener: SocketAddr,
    platform_addr: SocketAddr,
) -> Result<TransactionDirection> {
    let socket_addr = addr.get_socketaddr().map_err(Error::sip_stack)?;

    if addr.r#type == Some(Transport::Tcp) {
        if socket_addr.ip() == platform_addr.ip() {
            return Ok(TransactionDirection::Platform);
        }
        return Ok(TransactionDirection::Device);
    }

    if listener_matches(socket_addr, device_listener) {
        Ok(TransactionDirection::Device)
    } else if listener_matches(socket_addr, platform_listener) {
        Ok(TransactionDirection::Platform)
    } else {
        Err(Error::sip_stack(format!(
            "transaction arrived on unknown local address {socket_addr}"
        )))
    }
}

fn listener_matches(local: SocketAddr, listener: SocketAddr) -> bool {
    if local.port() != listener.port() {
        return false;
    }
    listener.ip().is_unspecified() || local.ip() == listener.ip()
}

fn from_user(request: &Request) -> Option<String> {
    request
        .from_header()
        .ok()
        .and_then(|header| header.typed().ok())
        .and_then(|from| from.uri.auth.map(|auth| auth.user))
}

/// Where the device actually is, per its own top Via: sent-by host/port,
/// overridden by `received`/`rport` when the device sits behind NAT.
fn device_source_from_via(via: &rsip::headers::Via) -> Result<(String, u16)> {
    let typed = via.typed().map_err(Error::sip_stack)?;
    let mut host = typed.sent_by().host().to_string();
    let mut port = typed.sent_by().port().map(|p| *p.value()).unwrap_or(5060);

    if let Ok(Some(received)) = typed.received() {
        host = received.to_string();
    }
    for param in &typed.params {
        if let Param::Other(name, Some(value)) = param
            && name.value().eq_ignore_ascii_case("rport")
            && let Ok(parsed) = value.value().parse::<u16>()
        {
            port = parsed;
        }
    }
    Ok((host, port))
}

fn rewrite_top_via(request: &mut Request, addr: SocketAddr) -> Result<()> {
    let via = request.via_header_mut().map_err(Error::sip_stack)?;
    let mut typed = via.clone().typed().map_err(Error::sip_stack)?;
    typed.uri.host_with_port = addr.into();
    *via = typed.into();
    Ok(())
}

fn rewrite_contact(request: &mut Request, addr: SocketAddr) {
    if let Ok(contact) = request.contact_header()
        && let Ok(mut typed) = contact.clone().typed()
    {
        typed.uri.host_with_port = addr.into();
        request
            .headers
            .unique_push(rsip::Header::Contact(typed.into()));
    }
}

/// Re-address a device request for the platform leg: Via and Contact claim
/// `client_ip:client_port`, everything else (branch, tags, body) rides along
/// untouched. The target is the platform with its configured transport.
fn to_platform_request(config: &ProxyConfig, original: &Request) -> Result<(Request, SipAddr)> {
    let mut request = original.clone();
    let leg_addr = config.client_addr();
    rewrite_top_via(&mut request, leg_addr)?;
    rewrite_contact(&mut request, leg_addr);

    let transport = match config.server_protocol {
        SipProtocol::Udp => Transport::Udp,
        SipProtocol::Tcp => Transport::Tcp,
    };
    let mut target: SipAddr = config.server_addr().into();
    target.r#type = Some(transport);
    Ok((request, target))
}

/// Mirror image of [`to_platform_request`]: Via and Contact claim
/// `proxy_ip:proxy_sip_port`, the request URI is repointed at the device's
/// registered address and the registered transport picks the target.
fn to_device_request(
    config: &ProxyConfig,
    original: &Request,
    device: &DeviceInfo,
) -> Result<(Request, SipAddr)> {
    let mut request = original.clone();
    let leg_addr = config.proxy_sip_addr();
    rewrite_top_via(&mut request, leg_addr)?;
    rewrite_contact(&mut request, leg_addr);

    let target = sip_addr_for(device.transport, &device.host, device.port)?;
    request.uri.host_with_port = target.addr.clone();
    Ok((request, target))
}

async fn relay_merged(tx: &mut Transaction, response: &Response) -> Result<()> {
    let mut merged = rsip::headers::Headers::default();
    merge_headers(&mut merged, &response.headers);
    let extra: Vec<rsip::Header> = merged.iter().cloned().collect();
    let body = (!response.body.is_empty()).then(|| response.body.clone());
    tx.reply_with(response.status_code.clone(), extra, body)
        .await
        .map_err(Error::sip_stack)
}

/// Bind a UDP SIP listener, retrying forever. A busy port must not kill the
/// proxy; devices reconnect on their own schedule once the port frees up.
async fn bind_udp_listener(addr: SocketAddr, cancel: &CancellationToken) -> UdpConnection {
    loop {
        match create_udp_listener(addr, cancel.child_token()).await {
            Ok(conn) => return conn,
            Err(err) => {
                warn!(%addr, error = %err, "sip udp listener bind failed, retrying");
                sleep(LISTEN_RETRY_DELAY).await;
            }
        }
    }
}

/// Same retry policy for TCP. The engine re-binds when it starts serving, so
/// this probes the port first to catch conflicts while they are retryable.
async fn bind_tcp_listener(addr: SocketAddr) -> Result<SipConnection> {
    loop {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(probe) => {
                drop(probe);
                let mut sip_addr: SipAddr = addr.into();
                sip_addr.r#type = Some(Transport::Tcp);
                match TcpListenerConnection::new(sip_addr, None).await {
                    Ok(listener) => return Ok(listener.into()),
                    Err(err) => {
                        warn!(%addr, error = %err, "sip tcp listener setup failed, retrying");
                        sleep(LISTEN_RETRY_DELAY).await;
                    }
                }
            }
            Err(err) => {
                warn!(%addr, error = %err, "sip tcp listener bind failed, retrying");
                sleep(LISTEN_RETRY_DELAY).await;
            }
        }
    }
}

async fn create_udp_listener(
    addr: SocketAddr,
    cancel_token: CancellationToken,
) -> Result<UdpConnection> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(Error::Transport)?;
    socket.set_reuse_address(true).map_err(Error::Transport)?;
    socket.bind(&addr.into()).map_err(Error::Transport)?;
    socket.set_nonblocking(true).map_err(Error::Transport)?;

    let std_socket: std::net::UdpSocket = socket.into();
    std_socket.set_nonblocking(true).map_err(Error::Transport)?;
    let udp_socket = UdpSocket::from_std(std_socket).map_err(Error::Transport)?;

    let mut sip_addr: SipAddr = addr.into();
    sip_addr.r#type = Some(Transport::Udp);

    let connection = UdpConnection::attach(
        UdpInner {
            conn: udp_socket,
            addr: sip_addr,
        },
        None,
        Some(cancel_token),
    )
    .await;

    Ok(connection)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionDirection {
    Device,
    Platform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientTarget {
    Platform,
    Device,
}
