use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cache::MessageCache,
    common::{
        errors::{GatewayError, QueueError, VoiceError},
        types::{AnyResult, ChannelId, MessageId},
    },
    configs::{Config, ReconnectConfig},
    gateway::{
        Connector, ConnectionState, DisconnectReason, Session, StateMachine, WsConnector,
        handler::Dispatcher, outbound::outbound_loop, reconnect::spawn_supervisor,
    },
    protocol::{ClientEvent, Envelope},
    queue::{ActionQueue, SendHandle},
    rest::{HttpMessageApi, MessageApi, OutgoingMessage, ServerMessage},
    voice::{VoiceConnection, VoiceServerInfo, gateway::VoiceGateway},
};

/// Ping gauge value before the first heartbeat ack of a connection.
const PING_UNKNOWN_MS: i64 = -1;

/// Last credentials handed to `connect`, kept for the reconnect supervisor.
/// Cleared by an expected disconnect, which is also how a caller cancels a
/// reconnect episode already in flight.
#[derive(Clone)]
pub(crate) struct Credentials {
    pub gateway_url: String,
    pub token: String,
}

/// Everything scoped to one connection attempt. The token is a child of the
/// client root; the handles cover the outbound loop, the dispatcher and the
/// queue drain loops.
struct Attempt {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    /// Keeps the outbound frame channel open for the attempt's life; the
    /// outbound loop exits once every sender is gone.
    #[allow(dead_code)]
    frames: mpsc::UnboundedSender<Envelope>,
}

pub(crate) struct ClientInner {
    config: Config,
    state: StateMachine,
    connector: Arc<dyn Connector>,
    rest: Arc<dyn MessageApi>,
    /// Concrete REST client when built over HTTP, for token installation.
    http_rest: Option<Arc<HttpMessageApi>>,
    queue: Arc<ActionQueue>,
    cache: Arc<MessageCache>,
    session: Mutex<Option<Arc<Session>>>,
    credentials: Mutex<Option<Credentials>>,
    attempt: AsyncMutex<Option<Attempt>>,
    voice: AsyncMutex<Option<Arc<VoiceConnection>>>,
    root: CancellationToken,
    events: mpsc::UnboundedSender<ClientEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
    reasons: mpsc::UnboundedSender<DisconnectReason>,
    ping_ms: Arc<AtomicI64>,
    last_heartbeat_sent: Arc<AtomicU64>,
}

impl ClientInner {
    pub(crate) fn root_token(&self) -> &CancellationToken {
        &self.root
    }

    pub(crate) fn credentials(&self) -> Option<Credentials> {
        self.credentials.lock().clone()
    }

    pub(crate) fn reconnect_config(&self) -> &ReconnectConfig {
        &self.config.reconnect
    }

    /// Drives one full connect: claim the Connecting transition, open the
    /// transport, identify, and block cooperatively until READY, a socket
    /// error, cancellation or the configured timeout.
    pub(crate) async fn connect(&self, gateway_url: &str, token: &str) -> Result<(), GatewayError> {
        if !self.state.begin_connect() {
            return Err(GatewayError::AlreadyConnected);
        }
        *self.credentials.lock() = Some(Credentials {
            gateway_url: gateway_url.to_string(),
            token: token.to_string(),
        });

        match self.run_handshake(gateway_url, token).await {
            Ok(()) => {
                if !self.state.complete_connect() {
                    // A disconnect claimed the attempt between READY and here.
                    self.state.wait_disconnected().await;
                    return Err(GatewayError::Cancelled);
                }
                if let Some(rest) = &self.http_rest {
                    rest.set_token(Some(token.to_string()));
                }
                let _ = self.events.send(ClientEvent::Connected);
                info!("connected to {}", gateway_url);
                Ok(())
            }
            Err(e) => {
                warn!("connect to {} failed: {}", gateway_url, e);
                match self.state.begin_disconnect() {
                    Some(_) => {
                        self.run_cleanup(
                            DisconnectReason::Unexpected { source: e.clone() },
                            false,
                        )
                        .await;
                    }
                    None => self.state.wait_disconnected().await,
                }
                Err(e)
            }
        }
    }

    async fn run_handshake(&self, gateway_url: &str, token: &str) -> Result<(), GatewayError> {
        let attempt_token = self.root.child_token();
        let (socket_tx, socket_rx) = self
            .connector
            .connect(gateway_url, attempt_token.clone())
            .await?;

        let session = Arc::new(Session::new(gateway_url, token));
        *self.session.lock() = Some(session.clone());
        self.last_heartbeat_sent.store(0, Ordering::Relaxed);
        self.ping_ms.store(PING_UNKNOWN_MS, Ordering::Relaxed);

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let mut handles = Vec::new();
        handles.push(tokio::spawn(outbound_loop(
            socket_tx,
            frame_rx,
            session.clone(),
            self.last_heartbeat_sent.clone(),
            Duration::from_millis(self.config.gateway.heartbeat_poll_ms.max(1)),
            attempt_token.clone(),
        )));

        let dispatcher = Dispatcher {
            socket: socket_rx,
            session,
            ready: Some(ready_tx),
            reasons: self.reasons.clone(),
            events: self.events.clone(),
            last_heartbeat_sent: self.last_heartbeat_sent.clone(),
            ping_ms: self.ping_ms.clone(),
            stale_multiplier: self.config.gateway.stale_multiplier.max(1),
            cancel: attempt_token.clone(),
        };
        handles.push(tokio::spawn(dispatcher.run()));

        if self.config.queue.enabled {
            handles.extend(self.queue.start(attempt_token.clone()));
        }

        *self.attempt.lock().await = Some(Attempt {
            token: attempt_token.clone(),
            handles,
            frames: frame_tx.clone(),
        });

        frame_tx
            .send(Envelope::identify(token))
            .map_err(|_| GatewayError::SocketClosed("outbound loop gone".into()))?;

        let timeout = Duration::from_millis(self.config.gateway.connect_timeout_ms);
        tokio::select! {
            _ = attempt_token.cancelled() => Err(GatewayError::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(GatewayError::HandshakeTimeout(timeout)),
            ready = ready_rx => match ready {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(GatewayError::SocketClosed("dispatcher exited".into())),
            },
        }
    }

    /// Caller-initiated disconnect: drop the stored credentials (cancelling
    /// any reconnect episode), then claim and run cleanup.
    pub(crate) async fn disconnect(&self) {
        *self.credentials.lock() = None;
        self.teardown(DisconnectReason::Expected).await;
    }

    /// Claims the Disconnecting transition; exactly one of any set of racing
    /// callers runs the cleanup body, the rest wait for the Disconnected
    /// signal. Safe to call from any state.
    pub(crate) async fn teardown(&self, reason: DisconnectReason) {
        match self.state.begin_disconnect() {
            Some(prior) => {
                let announce = prior == ConnectionState::Connected;
                self.run_cleanup(reason, announce).await;
            }
            None => {
                if self.state.current() == ConnectionState::Disconnecting {
                    self.state.wait_disconnected().await;
                }
            }
        }
    }

    /// The single cleanup body. Cancels the attempt scope, waits for every
    /// spawned task to observe it and exit, then declares Disconnected — no
    /// background work outlives the nominal disconnected state.
    async fn run_cleanup(&self, reason: DisconnectReason, announce: bool) {
        debug!("cleaning up connection ({})", reason.describe());

        if let Some(voice) = self.voice.lock().await.take() {
            voice.shutdown().await;
        }
        if let Some(attempt) = self.attempt.lock().await.take() {
            attempt.token.cancel();
            for handle in attempt.handles {
                let _ = handle.await;
            }
        }
        self.queue.halt();
        *self.session.lock() = None;
        if let Some(rest) = &self.http_rest {
            rest.set_token(None);
        }
        self.ping_ms.store(PING_UNKNOWN_MS, Ordering::Relaxed);

        self.state.complete_disconnect();
        if announce {
            let _ = self.events.send(ClientEvent::Disconnected {
                expected: reason.is_expected(),
                reason: reason.describe(),
            });
        }
        info!("disconnected ({})", reason.describe());
    }

    async fn join_voice(&self, info: VoiceServerInfo) -> Result<Arc<VoiceConnection>, VoiceError> {
        if !self.config.voice.enabled {
            return Err(VoiceError::Disabled);
        }
        if self.state.current() != ConnectionState::Connected {
            return Err(VoiceError::NotConnected);
        }
        let parent = self
            .attempt
            .lock()
            .await
            .as_ref()
            .map(|a| a.token.clone())
            .ok_or(VoiceError::NotConnected)?;

        // Replace any previous session wholesale.
        if let Some(previous) = self.voice.lock().await.take() {
            previous.shutdown().await;
        }

        let gateway = VoiceGateway::new(info, self.config.voice.clone(), self.connector.clone());
        let connection = gateway.connect(&parent).await?;
        *self.voice.lock().await = Some(connection.clone());
        Ok(connection)
    }

    async fn leave_voice(&self) {
        if let Some(connection) = self.voice.lock().await.take() {
            connection.shutdown().await;
        }
    }
}

/// The client connection manager: one gateway connection state machine, a
/// reconnect supervisor, the outgoing action queue and an optional voice
/// transport, all under one hierarchical cancellation scope.
pub struct ChatClient {
    inner: Arc<ClientInner>,
}

impl ChatClient {
    /// Builds a client over the production WebSocket and HTTP transports.
    pub fn new(config: Config) -> AnyResult<Self> {
        let rest = Arc::new(HttpMessageApi::new(&config.rest)?);
        Ok(Self::assemble(
            config,
            Arc::new(WsConnector),
            rest.clone(),
            Some(rest),
        ))
    }

    /// Builds a client over caller-supplied transport and REST
    /// implementations.
    pub fn with_parts(
        config: Config,
        connector: Arc<dyn Connector>,
        rest: Arc<dyn MessageApi>,
    ) -> Self {
        Self::assemble(config, connector, rest, None)
    }

    fn assemble(
        config: Config,
        connector: Arc<dyn Connector>,
        rest: Arc<dyn MessageApi>,
        http_rest: Option<Arc<HttpMessageApi>>,
    ) -> Self {
        let cache = Arc::new(MessageCache::new());
        let queue = Arc::new(ActionQueue::new(rest.clone(), cache.clone(), &config.queue));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (reasons_tx, reasons_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ClientInner {
            config,
            state: StateMachine::new(),
            connector,
            rest,
            http_rest,
            queue,
            cache,
            session: Mutex::new(None),
            credentials: Mutex::new(None),
            attempt: AsyncMutex::new(None),
            voice: AsyncMutex::new(None),
            root: CancellationToken::new(),
            events: events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            reasons: reasons_tx,
            ping_ms: Arc::new(AtomicI64::new(PING_UNKNOWN_MS)),
            last_heartbeat_sent: Arc::new(AtomicU64::new(0)),
        });

        spawn_supervisor(inner.clone(), reasons_rx);
        Self { inner }
    }

    /// Connects to the gateway and blocks until fully ready. Returns the
    /// token, which callers may store to speed up future connections.
    pub async fn connect(&self, gateway_url: &str, token: &str) -> Result<String, GatewayError> {
        self.inner.connect(gateway_url, token).await?;
        Ok(token.to_string())
    }

    /// Disconnects from the gateway. Idempotent, safe to call from any
    /// state and from racing tasks.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    pub async fn wait_connected(&self) {
        self.inner.state.wait_connected().await;
    }

    pub async fn wait_disconnected(&self) {
        self.inner.state.wait_disconnected().await;
    }

    /// Takes the event receiver. The first caller gets it; later calls
    /// return `None`.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.inner.events_rx.lock().take()
    }

    /// Gateway heartbeat latency in milliseconds, -1 before the first ack.
    pub fn gateway_ping_ms(&self) -> i64 {
        self.inner.ping_ms.load(Ordering::Relaxed)
    }

    /// Heartbeat interval negotiated by the current connection's handshake.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.inner
            .session
            .lock()
            .as_ref()
            .and_then(|s| s.heartbeat_interval())
    }

    pub fn cache(&self) -> &MessageCache {
        &self.inner.cache
    }

    pub fn action_queue(&self) -> &ActionQueue {
        &self.inner.queue
    }

    /// Sends a message and waits for the server confirmation. With queuing
    /// enabled this goes through the send FIFO; otherwise it calls the REST
    /// layer directly.
    pub async fn send_message(
        &self,
        channel: ChannelId,
        content: impl Into<String>,
    ) -> Result<Arc<ServerMessage>, QueueError> {
        if self.inner.config.queue.enabled {
            self.inner.queue.enqueue_send(channel, content).resolve().await
        } else {
            let body = OutgoingMessage::new(content.into());
            let confirmed = self
                .inner
                .rest
                .send_message(channel, &body)
                .await
                .map_err(QueueError::Rest)?;
            Ok(self.inner.cache.get_or_add(confirmed))
        }
    }

    /// Enqueues a send without waiting. The handle exposes the nonce for
    /// [`ActionQueue::rewrite_queued`] / [`ActionQueue::abort_queued`].
    pub fn queue_message(&self, channel: ChannelId, content: impl Into<String>) -> SendHandle {
        self.inner.queue.enqueue_send(channel, content)
    }

    pub async fn edit_message(
        &self,
        channel: ChannelId,
        message: MessageId,
        content: impl Into<String>,
    ) -> Result<(), QueueError> {
        if self.inner.config.queue.enabled {
            self.inner
                .queue
                .enqueue_edit(channel, message, content)
                .resolve()
                .await
        } else {
            self.inner
                .rest
                .edit_message(channel, message, &content.into())
                .await
                .map_err(QueueError::Rest)
        }
    }

    pub async fn delete_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<(), QueueError> {
        if self.inner.config.queue.enabled {
            self.inner
                .queue
                .enqueue_delete(channel, message)
                .resolve()
                .await
        } else {
            self.inner
                .rest
                .delete_message(channel, message)
                .await
                .map_err(QueueError::Rest)
        }
    }

    /// Joins a voice endpoint. Fails without touching the gateway
    /// connection; requires the client to be Connected and voice support
    /// enabled.
    pub async fn join_voice(
        &self,
        info: VoiceServerInfo,
    ) -> Result<Arc<VoiceConnection>, VoiceError> {
        self.inner.join_voice(info).await
    }

    /// Ends only the voice session; the gateway connection is unaffected.
    pub async fn leave_voice(&self) {
        self.inner.leave_voice().await;
    }

    /// Disconnects and cancels the client's root scope, ending the
    /// reconnect supervisor.
    pub async fn shutdown(&self) {
        self.inner.disconnect().await;
        self.inner.root.cancel();
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.inner.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::Mutex as TokioMutex;

    use super::*;
    use crate::{
        common::errors::RestError,
        gateway::socket::mock::{MockConnector, ServerEnd},
        protocol::opcodes,
        voice::VoiceState,
    };

    struct EchoApi {
        calls: TokioMutex<Vec<String>>,
    }

    impl EchoApi {
        fn new() -> Self {
            Self {
                calls: TokioMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MessageApi for EchoApi {
        async fn send_message(
            &self,
            channel: ChannelId,
            message: &OutgoingMessage,
        ) -> Result<ServerMessage, RestError> {
            self.calls
                .lock()
                .await
                .push(format!("send:{}", message.content));
            Ok(ServerMessage {
                id: MessageId(900),
                channel_id: channel,
                content: message.content.clone(),
                author_id: None,
                nonce: message.nonce.clone(),
                timestamp: None,
            })
        }

        async fn edit_message(
            &self,
            _channel: ChannelId,
            message: MessageId,
            _content: &str,
        ) -> Result<(), RestError> {
            self.calls.lock().await.push(format!("edit:{}", message));
            Ok(())
        }

        async fn delete_message(
            &self,
            _channel: ChannelId,
            message: MessageId,
        ) -> Result<(), RestError> {
            self.calls.lock().await.push(format!("delete:{}", message));
            Ok(())
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.gateway.heartbeat_poll_ms = 10;
        config.queue.drain_interval_ms = 10;
        config.voice.discovery_timeout_ms = 200;
        config.voice.connect_timeout_ms = 2_000;
        config
    }

    fn test_client() -> (
        Arc<ChatClient>,
        mpsc::UnboundedReceiver<ServerEnd>,
        Arc<MockConnector>,
    ) {
        let (connector, accepts) = MockConnector::new();
        let client = ChatClient::with_parts(
            test_config(),
            connector.clone(),
            Arc::new(EchoApi::new()),
        );
        (Arc::new(client), accepts, connector)
    }

    async fn connect_ready(
        client: &Arc<ChatClient>,
        accepts: &mut mpsc::UnboundedReceiver<ServerEnd>,
    ) -> ServerEnd {
        let connect = {
            let client = client.clone();
            tokio::spawn(async move { client.connect("wss://gw.example", "token-A").await })
        };
        let mut server = accepts.recv().await.expect("no connection attempt");
        let identify = server.recv_envelope().await.expect("no identify frame");
        assert_eq!(identify.op, opcodes::gateway::IDENTIFY);
        assert_eq!(identify.d["token"], "token-A");
        server.send_ready(41_250);
        let token = connect.await.unwrap().expect("connect failed");
        assert_eq!(token, "token-A");
        server
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_completes_on_ready_and_heartbeats_follow() {
        let (client, mut accepts, _connector) = test_client();
        let mut server = connect_ready(&client, &mut accepts).await;
        assert_eq!(client.state(), ConnectionState::Connected);

        // A keepalive frame shows up within the negotiated interval window.
        let beat = server.recv_envelope().await.expect("no heartbeat");
        assert_eq!(beat.op, opcodes::gateway::HEARTBEAT);
        assert!(beat.d.is_null());

        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_surfaces_to_caller() {
        let (client, mut accepts, _connector) = test_client();
        let connect = {
            let client = client.clone();
            tokio::spawn(async move { client.connect("wss://gw.example", "token-A").await })
        };
        // Accept the socket but never send READY.
        let _server = accepts.recv().await.unwrap();

        let result = connect.await.unwrap();
        assert!(matches!(result, Err(GatewayError::HandshakeTimeout(_))));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_connect_while_connected_is_rejected() {
        let (client, mut accepts, _connector) = test_client();
        let _server = connect_ready(&client, &mut accepts).await;

        let second = client.connect("wss://gw.example", "token-A").await;
        assert!(matches!(second, Err(GatewayError::AlreadyConnected)));
        assert_eq!(client.state(), ConnectionState::Connected);

        client.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_disconnects_both_resolve_with_one_cleanup() {
        let (client, mut accepts, _connector) = test_client();
        let mut events = client.take_events().unwrap();
        let _server = connect_ready(&client, &mut accepts).await;

        let (a, b) = {
            let c1 = client.clone();
            let c2 = client.clone();
            tokio::join!(
                tokio::spawn(async move { c1.disconnect().await }),
                tokio::spawn(async move { c2.disconnect().await }),
            )
        };
        a.unwrap();
        b.unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);

        // Cleanup ran once: exactly one Disconnected notification.
        let mut disconnects = 0;
        while let Ok(event) = events.try_recv() {
            if let ClientEvent::Disconnected { expected, .. } = event {
                assert!(expected);
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_close_reconnects_with_last_token() {
        let (client, mut accepts, _connector) = test_client();
        let server = connect_ready(&client, &mut accepts).await;

        // Connection dies out from under the client.
        server.hang_up();

        // The supervisor re-drives connect with the stored credentials.
        let mut second = accepts.recv().await.expect("no reconnect attempt");
        let identify = second.recv_envelope().await.expect("no identify");
        assert_eq!(identify.d["token"], "token-A");
        second.send_ready(41_250);

        client.wait_connected().await;
        assert_eq!(client.state(), ConnectionState::Connected);

        client.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_retries_through_failed_attempts() {
        let (client, mut accepts, connector) = test_client();
        let server = connect_ready(&client, &mut accepts).await;

        // First two reconnect attempts are refused at the transport level.
        connector.fail_next(2);
        server.hang_up();

        let mut third = accepts.recv().await.expect("no surviving attempt");
        third.recv_envelope().await.expect("no identify");
        third.send_ready(41_250);

        client.wait_connected().await;
        assert_eq!(client.state(), ConnectionState::Connected);

        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_silence_becomes_unexpected_disconnect() {
        let (client, mut accepts, _connector) = test_client();
        // Socket stays open but the server goes completely quiet: the read
        // timeout declares the connection dead and the supervisor redials.
        let _quiet_server = connect_ready(&client, &mut accepts).await;

        let mut second = accepts.recv().await.expect("no reconnect after stale read");
        second.recv_envelope().await.expect("no identify");
        second.send_ready(41_250);

        client.wait_connected().await;
        assert_eq!(client.state(), ConnectionState::Connected);

        client.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expected_disconnect_does_not_reconnect() {
        let (client, mut accepts, _connector) = test_client();
        let _server = connect_ready(&client, &mut accepts).await;

        client.disconnect().await;

        // Give the supervisor room; no new connection attempt may appear.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(accepts.try_recv().is_err());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_message_resolves_with_cached_entity() {
        let (client, mut accepts, _connector) = test_client();
        let _server = connect_ready(&client, &mut accepts).await;

        let confirmed = client
            .send_message(ChannelId(5), "hello there")
            .await
            .unwrap();
        assert_eq!(confirmed.content, "hello there");
        assert!(client.cache().get(confirmed.id).is_some());

        client.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_actions_resolve_when_connection_drops() {
        let (client, mut accepts, _connector) = test_client();
        let _server = connect_ready(&client, &mut accepts).await;

        client.disconnect().await;
        let late = client.send_message(ChannelId(5), "too late").await;
        assert!(matches!(late, Err(QueueError::Stopped)));
    }

    async fn drive_voice_server(
        accepts: &mut mpsc::UnboundedReceiver<ServerEnd>,
        udp: &tokio::net::UdpSocket,
        ssrc: u32,
    ) -> ServerEnd {
        let mut signaling = accepts.recv().await.expect("no voice signaling connect");
        let identify = signaling.recv_envelope().await.expect("no voice identify");
        assert_eq!(identify.op, opcodes::voice::IDENTIFY);

        signaling.send_json(&Envelope::new(
            opcodes::voice::HELLO,
            serde_json::json!({ "heartbeat_interval": 30_000 }),
        ));
        let port = udp.local_addr().unwrap().port();
        signaling.send_json(&Envelope::new(
            opcodes::voice::READY,
            serde_json::json!({
                "ssrc": ssrc,
                "ip": "127.0.0.1",
                "port": port,
                "modes": ["plain", "xsalsa20_poly1305"],
            }),
        ));

        // Answer the 70-byte discovery probe.
        let mut buf = [0u8; 70];
        let (n, from) = udp.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 70);
        assert_eq!(&buf[0..4], &ssrc.to_be_bytes());
        let mut response = [0u8; 70];
        let ip = b"127.0.0.1";
        response[4..4 + ip.len()].copy_from_slice(ip);
        response[68..70].copy_from_slice(&from.port().to_le_bytes());
        udp.send_to(&response, from).await.unwrap();

        let select = signaling
            .recv_envelope()
            .await
            .expect("no select-protocol frame");
        assert_eq!(select.op, opcodes::voice::SELECT_PROTOCOL);
        assert_eq!(select.d["data"]["mode"], "plain");

        signaling.send_json(&Envelope::new(
            opcodes::voice::SESSION_DESCRIPTION,
            serde_json::json!({ "mode": "plain" }),
        ));
        signaling
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_voice_join_discovers_and_paces_audio() {
        let (client, mut accepts, _connector) = test_client();
        let _server = connect_ready(&client, &mut accepts).await;

        let udp = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let info = VoiceServerInfo {
            endpoint: "voice.example".into(),
            server_id: "guild-1".into(),
            session_id: crate::common::types::SessionId::generate(),
            token: "voice-token".into(),
            user_id: crate::common::types::UserId(77),
        };

        let join = {
            let client = client.clone();
            tokio::spawn(async move { client.join_voice(info).await })
        };
        let mut signaling = drive_voice_server(&mut accepts, &udp, 1234).await;

        let connection = tokio::time::timeout(Duration::from_secs(5), join)
            .await
            .expect("join_voice hung")
            .unwrap()
            .expect("join_voice failed");
        assert_eq!(connection.state(), VoiceState::Ready);
        assert_eq!(connection.ssrc(), 1234);

        // The speaking announcement precedes any audio.
        let speaking = signaling.recv_envelope().await.unwrap();
        assert_eq!(speaking.op, opcodes::voice::SPEAKING);

        connection.play(vec![0xAB; 8]).await.unwrap();
        let mut buf = [0u8; 128];
        let n = tokio::time::timeout(Duration::from_secs(2), udp.recv(&mut buf))
            .await
            .expect("no RTP packet")
            .unwrap();
        assert_eq!(buf[0], 0x80);
        assert_eq!(&buf[8..12], &1234u32.to_be_bytes());
        assert_eq!(&buf[12..n], &[0xAB; 8]);

        // Leaving voice must not touch the gateway connection.
        client.leave_voice().await;
        assert_eq!(client.state(), ConnectionState::Connected);

        client.disconnect().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_voice_discovery_timeout_surfaces_to_join_caller() {
        let (client, mut accepts, _connector) = test_client();
        let _server = connect_ready(&client, &mut accepts).await;

        let info = VoiceServerInfo {
            endpoint: "voice.example".into(),
            server_id: "guild-1".into(),
            session_id: crate::common::types::SessionId::generate(),
            token: "voice-token".into(),
            user_id: crate::common::types::UserId(77),
        };
        let join = {
            let client = client.clone();
            tokio::spawn(async move { client.join_voice(info).await })
        };

        let signaling = accepts.recv().await.expect("no voice signaling connect");
        signaling.send_json(&Envelope::new(
            opcodes::voice::HELLO,
            serde_json::json!({ "heartbeat_interval": 30_000 }),
        ));
        // Point discovery at a socket that never answers.
        let dead = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        signaling.send_json(&Envelope::new(
            opcodes::voice::READY,
            serde_json::json!({
                "ssrc": 9,
                "ip": "127.0.0.1",
                "port": dead.local_addr().unwrap().port(),
                "modes": ["plain"],
            }),
        ));

        let result = tokio::time::timeout(Duration::from_secs(5), join)
            .await
            .expect("join_voice hung")
            .unwrap();
        assert!(matches!(result, Err(VoiceError::DiscoveryTimeout)));

        // The primary connection is unaffected.
        assert_eq!(client.state(), ConnectionState::Connected);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_join_voice_requires_connection_and_capability() {
        let (client, _accepts, _connector) = test_client();
        let info = VoiceServerInfo {
            endpoint: "voice.example".into(),
            server_id: "guild-1".into(),
            session_id: crate::common::types::SessionId::generate(),
            token: "voice-token".into(),
            user_id: crate::common::types::UserId(77),
        };
        let result = client.join_voice(info.clone()).await;
        assert!(matches!(result, Err(VoiceError::NotConnected)));

        let mut config = test_config();
        config.voice.enabled = false;
        let (connector, _accepts2) = MockConnector::new();
        let disabled = ChatClient::with_parts(config, connector, Arc::new(EchoApi::new()));
        let result = disabled.join_voice(info).await;
        assert!(matches!(result, Err(VoiceError::Disabled)));
    }
}
