//! # Connection Lifecycle
//!
//! The [`Client`] drives one connection from socket open to teardown:
//!
//! ```text
//! Connecting → Handshaking → Authenticating → Open → Closing → Closed
//! ```
//!
//! States only ever advance; a failed handshake goes straight to `Closed`
//! rather than back to `Connecting`. Reconnecting means building a new
//! `Client` — crypto state, frame codec and pending queries never survive
//! a connection.
//!
//! ## Tasks
//!
//! Two background tasks run per connection:
//! - the **read loop** pulls socket messages, feeds them through the
//!   [`Transport`] and dispatches decoded nodes in arrival order
//! - the **keepalive watchdog** wakes every keepalive interval, declares
//!   the connection lost when no traffic arrived for an interval plus a
//!   five second grace, and otherwise fires a ping query concurrently so
//!   a slow ping response cannot stall the idle check
//!
//! Teardown is idempotent: whichever path observes the failure first wins,
//! every pending query is rejected, and exactly one `Closed` update is
//! published on the event bus.

use crate::auth::{Credentials, KeyPair};
use crate::config::{ClientConfig, SERVER_JID};
use crate::core::framing::FrameCodec;
use crate::core::node::{Node, NodeCodec};
use crate::error::{ClientError, DisconnectReason, Result};
use crate::protocol::dispatcher::{Dispatcher, ListenerId, ListenerKey};
use crate::protocol::handshake::HandshakeEngine;
use crate::protocol::wire;
use crate::service::pairing;
use crate::transport::socket::{self, SocketSink, SocketStream};
use crate::transport::Transport;
use crate::utils::timeout::{with_optional_timeout, with_timeout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

/// Grace added to the keepalive interval before idle means lost.
const KEEPALIVE_GRACE: Duration = Duration::from_secs(5);

/// Capacity of the connection-update broadcast channel.
const EVENT_BUS_CAPACITY: usize = 64;

/// Where a connection is in its life.
///
/// Transitions are strictly forward; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket opening.
    Connecting,
    /// Encryption handshake in flight.
    Handshaking,
    /// Channel encrypted, waiting for the server's auth verdict.
    Authenticating,
    /// Fully usable.
    Open,
    /// Teardown started.
    Closing,
    /// Terminal.
    Closed,
}

/// One event on the connection bus.
#[derive(Debug, Clone)]
pub struct ConnectionUpdate {
    /// State at the time of the event.
    pub state: ConnectionState,
    /// Present exactly once, on the terminal `Closed` update.
    pub reason: Option<DisconnectReason>,
    /// Pairing payload to render as a QR code, when the server offered one.
    pub pairing_ref: Option<String>,
    /// Set on the update published right after a successful pairing.
    pub is_new_login: bool,
}

impl ConnectionUpdate {
    fn state(state: ConnectionState) -> Self {
        Self {
            state,
            reason: None,
            pairing_ref: None,
            is_new_login: false,
        }
    }
}

/// Shared core of one connection, owned jointly by the [`Client`] handle
/// and the background tasks.
pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) transport: Transport,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) creds: Mutex<Credentials>,
    state: Mutex<ConnectionState>,
    events: broadcast::Sender<ConnectionUpdate>,
    /// Instant of the last socket traffic, for the keepalive watchdog.
    last_traffic: Mutex<Instant>,
    /// `Some` once teardown has begun; records the winning reason.
    closed: Mutex<Option<DisconnectReason>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    /// Set after a pairing reply; the next inbound node decides whether the
    /// registration stuck.
    pub(crate) pairing_restart: AtomicBool,
}

/// Handle to one live connection.
///
/// Cheap to clone; all clones drive the same connection. Dropping every
/// handle does not close the socket — call [`Client::close`] or
/// [`Client::logout`].
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect to the configured endpoint and run the handshake and
    /// authentication exchange.
    ///
    /// Returns once the encrypted channel is up and the auth payload has
    /// been sent; subscribe to [`Client::updates`] to observe the `Open`
    /// transition (or a pairing offer for unregistered credentials).
    #[instrument(skip_all, fields(endpoint = %config.endpoint))]
    pub async fn connect(
        config: ClientConfig,
        codec: Arc<dyn NodeCodec>,
        creds: Credentials,
    ) -> Result<Client> {
        config.validate()?;
        let timeout = config.connect_timeout();
        let (sink, stream) =
            with_timeout(socket::connect_websocket(&config.endpoint), timeout).await?;
        Self::connect_over(config, codec, creds, sink, stream).await
    }

    /// Run the connection over an already-open socket pair.
    ///
    /// This is the seam the in-memory socket tests drive; [`Client::connect`]
    /// is this plus a WebSocket dial.
    pub async fn connect_over(
        config: ClientConfig,
        codec: Arc<dyn NodeCodec>,
        creds: Credentials,
        sink: Box<dyn SocketSink>,
        mut stream: Box<dyn SocketStream>,
    ) -> Result<Client> {
        config.validate()?;

        let noise = HandshakeEngine::new(crate::config::PROTOCOL_NAME, KeyPair::generate());
        let framer = FrameCodec::new(config.routing_info.clone());
        let transport = Transport::new(sink, noise, framer, codec);
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let connect_timeout = config.connect_timeout();

        let inner = Arc::new(ClientInner {
            config,
            transport,
            dispatcher: Dispatcher::new(),
            creds: Mutex::new(creds),
            state: Mutex::new(ConnectionState::Connecting),
            events,
            last_traffic: Mutex::new(Instant::now()),
            closed: Mutex::new(None),
            keepalive: Mutex::new(None),
            pairing_restart: AtomicBool::new(false),
        });

        if let Err(e) = with_timeout(inner.run_handshake(&mut stream), connect_timeout).await {
            inner.end(DisconnectReason::from(&e));
            return Err(e);
        }
        inner.set_state(ConnectionState::Authenticating);

        let reader = Arc::clone(&inner);
        tokio::spawn(async move { reader.read_loop(stream).await });
        let watchdog = Arc::clone(&inner);
        let handle = tokio::spawn(async move { watchdog.keepalive_loop().await });
        *inner.keepalive.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        Ok(Client { inner })
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to connection updates.
    pub fn updates(&self) -> broadcast::Receiver<ConnectionUpdate> {
        self.inner.events.subscribe()
    }

    /// Read something out of the credentials, e.g. to persist them after a
    /// pairing rewrote the identity.
    pub fn with_credentials<T>(&self, f: impl FnOnce(&Credentials) -> T) -> T {
        f(&self.inner.creds.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Send a node without waiting for any response.
    pub async fn send_node(&self, node: &Node) -> Result<()> {
        if self.inner.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }
        self.inner.transport.send_node(node).await
    }

    /// Send a request node and await the response correlated by its `id`
    /// attribute, allocating one when the node carries none.
    ///
    /// `timeout` of `None` applies the configured query timeout; a response
    /// carrying an error child surfaces as [`ClientError::RequestFailed`].
    pub async fn query(&self, node: Node, timeout: Option<Duration>) -> Result<Node> {
        self.inner.query(node, timeout).await
    }

    /// Register a listener for inbound nodes matching `key`.
    pub fn listen<F>(&self, key: ListenerKey, callback: F) -> ListenerId
    where
        F: Fn(&Node) + Send + Sync + 'static,
    {
        self.inner.dispatcher.listen(key, callback)
    }

    /// Remove a previously registered listener.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.dispatcher.remove_listener(id)
    }

    /// Wait until an update satisfies `check`, starting from a snapshot of
    /// the current state.
    ///
    /// Fails with the close reason if the connection closes first, or with
    /// [`ClientError::Timeout`] when `timeout` elapses.
    pub async fn wait_for_update<F>(&self, check: F, timeout: Option<Duration>) -> Result<()>
    where
        F: Fn(&ConnectionUpdate) -> bool,
    {
        let mut rx = self.inner.events.subscribe();
        let snapshot = ConnectionUpdate {
            state: self.state(),
            reason: self.inner.closed.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            pairing_ref: None,
            is_new_login: false,
        };
        if check(&snapshot) {
            return Ok(());
        }
        if snapshot.state == ConnectionState::Closed {
            return Err(snapshot
                .reason
                .map(|r| r.to_error())
                .unwrap_or(ClientError::ConnectionClosed));
        }

        with_optional_timeout(
            async move {
                loop {
                    let update = match rx.recv().await {
                        Ok(update) => update,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(ClientError::ConnectionClosed)
                        }
                    };
                    if check(&update) {
                        return Ok(());
                    }
                    if update.state == ConnectionState::Closed {
                        return Err(update
                            .reason
                            .map(|r| r.to_error())
                            .unwrap_or(ClientError::ConnectionClosed));
                    }
                }
            },
            timeout,
        )
        .await
    }

    /// Wait until the connection reaches `Open`.
    pub async fn wait_for_open(&self, timeout: Option<Duration>) -> Result<()> {
        self.wait_for_update(|u| u.state == ConnectionState::Open, timeout)
            .await
    }

    /// Ask the server to unregister this device, then close.
    ///
    /// The removal request is best-effort; teardown happens regardless.
    pub async fn logout(&self) {
        let jid = self
            .inner
            .creds
            .lock()
            .unwrap()
            .me
            .as_ref()
            .map(|me| me.jid.clone());
        if let Some(jid) = jid {
            let node = Node::new("iq")
                .attr("to", SERVER_JID)
                .attr("type", "set")
                .attr("xmlns", "md")
                .attr("id", self.inner.dispatcher.next_tag())
                .children(vec![Node::new("remove-companion-device")
                    .attr("jid", jid)
                    .attr("reason", "user_initiated")]);
            if let Err(e) = self.inner.transport.send_node(&node).await {
                debug!(error = %e, "device removal request failed");
            }
        }
        self.inner.end(DisconnectReason::LoggedOut);
    }

    /// Close the connection. Safe to call more than once.
    pub async fn close(&self) {
        self.inner.end(DisconnectReason::ConnectionClosed);
    }
}

impl ClientInner {
    /// Drive the three-message handshake over the raw stream, then switch
    /// the engine into transport mode.
    async fn run_handshake(self: &Arc<Self>, stream: &mut Box<dyn SocketStream>) -> Result<()> {
        self.set_state(ConnectionState::Handshaking);

        let hello = wire::encode_client_hello(&self.transport.with_noise(|n| n.ephemeral_public()));
        self.transport.send_raw(&hello).await?;

        let frame = self.next_raw_frame(stream).await?;
        let server_hello = wire::decode_server_hello(&frame)?;

        let (static_enc, payload_enc) = {
            let creds = self.creds.lock().unwrap_or_else(|e| e.into_inner());
            let payload = match &creds.me {
                Some(me) => {
                    debug!(jid = %me.jid, "authenticating bound identity");
                    wire::encode_login_payload(&me.jid)?
                }
                None => {
                    debug!("no bound identity, requesting registration");
                    let build_hash =
                        crate::utils::crypto::sha256(crate::config::CLIENT_VERSION.as_bytes());
                    wire::encode_registration_payload(&wire::RegistrationData {
                        registration_id: u32::from(creds.registration_id),
                        identity_key: creds.identity_public(),
                        signed_pre_key_id: creds.signed_pre_key.key_id,
                        signed_pre_key: creds.signed_pre_key.key_pair.public_bytes(),
                        signed_pre_key_signature: creds.signed_pre_key.signature.clone(),
                        build_hash: build_hash[..16].to_vec(),
                    })
                }
            };
            self.transport.with_noise(|noise| -> Result<_> {
                let static_enc = noise.process_server_hello(&server_hello, &creds.noise_key)?;
                let payload_enc = noise.encrypt(&payload)?;
                Ok((static_enc, payload_enc))
            })?
        };

        self.transport
            .send_raw(&wire::encode_client_finish(&static_enc, &payload_enc))
            .await?;
        self.transport.with_noise(|noise| noise.finish());
        debug!("handshake complete, channel encrypted");
        Ok(())
    }

    /// Pull socket messages until the transport yields one complete frame.
    async fn next_raw_frame(&self, stream: &mut Box<dyn SocketStream>) -> Result<Vec<u8>> {
        loop {
            let bytes = match stream.recv().await {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => return Err(e),
                None => return Err(ClientError::ConnectionClosed),
            };
            self.touch_traffic();
            let mut frames = self.transport.receive(&bytes)?;
            if !frames.is_empty() {
                let (raw, _) = frames.remove(0);
                return Ok(raw);
            }
        }
    }

    /// Read loop: socket → frames → dispatch, strictly in arrival order.
    async fn read_loop(self: Arc<Self>, mut stream: Box<dyn SocketStream>) {
        loop {
            let Some(result) = stream.recv().await else {
                self.end(DisconnectReason::ConnectionClosed);
                return;
            };
            if self.is_closed() {
                trace!("dropping socket bytes after close");
                return;
            }
            let bytes = match result {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.end(DisconnectReason::from(&e));
                    return;
                }
            };
            self.touch_traffic();
            let frames = match self.transport.receive(&bytes) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(error = %e, "inbound frame rejected, closing");
                    self.end(DisconnectReason::from(&e));
                    return;
                }
            };
            for (_, node) in frames {
                let Some(node) = node else { continue };
                trace!(tag = %node.tag, id = ?node.id(), "inbound node");
                self.dispatcher.dispatch(&node);
                self.handle_node(&node).await;
                if self.is_closed() {
                    return;
                }
            }
        }
    }

    /// React to control nodes the connection machinery owns.
    async fn handle_node(self: &Arc<Self>, node: &Node) {
        if self.pairing_restart.swap(false, Ordering::AcqRel) {
            pairing::finish_restart(self, node);
            return;
        }
        match node.tag.as_str() {
            "iq" if node.get_attr("type") == Some("set") && node.child("pair-device").is_some() => {
                pairing::handle_pair_device(self, node).await;
            }
            "iq" if node.child("pair-success").is_some() => {
                pairing::handle_pair_success(self, node).await;
            }
            "success" => {
                // runs off the read loop: the queries below need the loop
                // free to deliver their responses
                let inner = Arc::clone(self);
                tokio::spawn(async move { inner.handle_auth_success().await });
            }
            "failure" => {
                let code = node.get_attr("reason").unwrap_or("unknown");
                debug!(code, "authentication rejected");
                if code == "401" {
                    self.end(DisconnectReason::LoggedOut);
                } else {
                    self.end(DisconnectReason::ConnectionClosed);
                }
            }
            "stream:error" => {
                let code = node.get_attr("code").unwrap_or("unknown");
                warn!(code, "server stream error");
                self.end(DisconnectReason::ConnectionClosed);
            }
            "stream:end" => self.end(DisconnectReason::ConnectionClosed),
            _ => {}
        }
    }

    /// The server accepted our identity: top up pre-keys if the server
    /// never saw a batch, flip to active delivery mode, go `Open`.
    async fn handle_auth_success(self: &Arc<Self>) {
        let needs_upload = {
            let creds = self.creds.lock().unwrap_or_else(|e| e.into_inner());
            !creds.server_has_pre_keys
        };
        if needs_upload {
            if let Err(e) = self.upload_pre_keys().await {
                warn!(error = %e, "pre-key upload failed");
                self.end(DisconnectReason::from(&e));
                return;
            }
        }
        if let Err(e) = self.send_passive_toggle(false).await {
            debug!(error = %e, "active-mode toggle failed");
            self.end(DisconnectReason::from(&e));
            return;
        }
        // the connection may have died under the queries above; the closed
        // guard is held across the publish so `Open` can never trail the
        // terminal `Closed` update
        {
            let closed = self.closed.lock().unwrap_or_else(|e| e.into_inner());
            if closed.is_some() {
                return;
            }
            *self.state.lock().unwrap_or_else(|e| e.into_inner()) = ConnectionState::Open;
            self.publish(ConnectionUpdate::state(ConnectionState::Open));
        }
        debug!("connection open");
    }

    /// Upload a fresh pre-key batch with the identity bundle.
    async fn upload_pre_keys(self: &Arc<Self>) -> Result<()> {
        let (node, last_id) = {
            let mut creds = self.creds.lock().unwrap_or_else(|e| e.into_inner());
            let count = self.config.pre_key_upload_count;
            let batch = creds.generate_pre_keys(count);
            let last_id = batch.last().map(|(id, _)| *id).unwrap_or(0);
            let keys = batch
                .iter()
                .map(|(id, kp)| {
                    Node::new("key").children(vec![
                        Node::new("id").bytes(id.to_be_bytes()[1..].to_vec()),
                        Node::new("value").bytes(kp.public_bytes().to_vec()),
                    ])
                })
                .collect();
            let skey = Node::new("skey").children(vec![
                Node::new("id").bytes(creds.signed_pre_key.key_id.to_be_bytes()[1..].to_vec()),
                Node::new("value").bytes(creds.signed_pre_key.key_pair.public_bytes().to_vec()),
                Node::new("signature").bytes(creds.signed_pre_key.signature.clone()),
            ]);
            let node = Node::new("iq")
                .attr("id", self.dispatcher.next_tag())
                .attr("xmlns", "encrypt")
                .attr("type", "set")
                .attr("to", SERVER_JID)
                .children(vec![
                    Node::new("registration")
                        .bytes(u32::from(creds.registration_id).to_be_bytes().to_vec()),
                    Node::new("type").bytes(vec![crate::auth::KEY_BUNDLE_TYPE]),
                    Node::new("identity").bytes(creds.identity_public().to_vec()),
                    Node::new("list").children(keys),
                    skey,
                ]);
            (node, last_id)
        };

        debug!(count = self.config.pre_key_upload_count, "uploading pre-keys");
        self.query(node, None).await?;
        self.creds.lock().unwrap_or_else(|e| e.into_inner()).mark_pre_keys_uploaded(last_id);
        Ok(())
    }

    /// Toggle passive delivery; `false` asks for full traffic.
    async fn send_passive_toggle(self: &Arc<Self>, passive: bool) -> Result<()> {
        let tag = if passive { "passive" } else { "active" };
        let node = Node::new("iq")
            .attr("to", SERVER_JID)
            .attr("xmlns", "passive")
            .attr("type", "set")
            .attr("id", self.dispatcher.next_tag())
            .children(vec![Node::new(tag)]);
        self.query(node, None).await?;
        Ok(())
    }

    /// Correlated request/response; see [`Client::query`].
    async fn query(self: &Arc<Self>, mut node: Node, timeout: Option<Duration>) -> Result<Node> {
        if self.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }
        let id = match node.id() {
            Some(id) => id.to_string(),
            None => {
                let tag = self.dispatcher.next_tag();
                node.attrs.insert("id".into(), tag.clone());
                tag
            }
        };

        let rx = self.dispatcher.register_waiter(&id);
        if let Err(e) = self.transport.send_node(&node).await {
            self.dispatcher.forget_waiter(&id);
            return Err(e);
        }

        let timeout = timeout.or_else(|| Some(self.config.query_timeout()));
        let response = match with_optional_timeout(Dispatcher::await_response(rx), timeout).await {
            Ok(response) => response,
            Err(e) => {
                if matches!(e, ClientError::Timeout) {
                    self.dispatcher.forget_waiter(&id);
                }
                return Err(e);
            }
        };
        response.ensure_error_free()?;
        Ok(response)
    }

    /// Watchdog: declare the connection lost on prolonged silence, and
    /// otherwise probe it with a concurrent ping.
    async fn keepalive_loop(self: Arc<Self>) {
        let interval = self.config.keepalive_interval();
        loop {
            tokio::time::sleep(interval).await;
            if self.is_closed() {
                return;
            }
            let idle = self.last_traffic.lock().unwrap_or_else(|e| e.into_inner()).elapsed();
            if idle > interval + KEEPALIVE_GRACE {
                debug!(idle_ms = idle.as_millis() as u64, "keepalive window missed");
                self.end(DisconnectReason::ConnectionLost);
                return;
            }

            // The ping runs concurrently so a stalled response never delays
            // the next idle check.
            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                let ping = Node::new("iq")
                    .attr("id", inner.dispatcher.next_tag())
                    .attr("to", SERVER_JID)
                    .attr("type", "get")
                    .attr("xmlns", "w:p")
                    .children(vec![Node::new("ping")]);
                match inner.query(ping, Some(inner.config.keepalive_interval())).await {
                    Ok(_) => trace!("keepalive ack"),
                    Err(_) if inner.is_closed() => {}
                    Err(e) => {
                        debug!(error = %e, "keepalive ping failed");
                        inner.end(DisconnectReason::ConnectionLost);
                    }
                }
            });
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
        self.publish(ConnectionUpdate::state(state));
    }

    pub(crate) fn publish(&self, update: ConnectionUpdate) {
        // No subscribers is fine.
        let _ = self.events.send(update);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    fn touch_traffic(&self) {
        *self.last_traffic.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Tear the connection down once; later callers are no-ops.
    pub(crate) fn end(self: &Arc<Self>, reason: DisconnectReason) {
        {
            let mut closed = self.closed.lock().unwrap_or_else(|e| e.into_inner());
            if closed.is_some() {
                return;
            }
            *closed = Some(reason.clone());
        }
        debug!(?reason, "closing connection");
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = ConnectionState::Closing;

        if let Some(handle) = self.keepalive.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        self.dispatcher.reject_all_waiters();

        // The socket close is async; finish it off the caller's stack so
        // end() stays callable from the read loop itself.
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.transport.close().await });

        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = ConnectionState::Closed;
        self.publish(ConnectionUpdate {
            state: ConnectionState::Closed,
            reason: Some(reason),
            pairing_ref: None,
            is_new_login: false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_constructor_is_bare() {
        let update = ConnectionUpdate::state(ConnectionState::Open);
        assert_eq!(update.state, ConnectionState::Open);
        assert!(update.reason.is_none());
        assert!(update.pairing_ref.is_none());
        assert!(!update.is_new_login);
    }

    #[test]
    fn states_are_distinct() {
        assert_ne!(ConnectionState::Closing, ConnectionState::Closed);
        assert_ne!(ConnectionState::Connecting, ConnectionState::Handshaking);
    }
}
