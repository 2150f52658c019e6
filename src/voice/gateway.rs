use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::UdpSocket,
    sync::{Mutex, Notify, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    VoiceServerInfo, VoiceState,
    constants::{
        DEFAULT_VOICE_HEARTBEAT_MS, DEFAULT_VOICE_MODE, PREFERRED_MODES, VOICE_GATEWAY_VERSION,
    },
    discovery::discover_ip,
    pacer::pace_loop,
    rtp::RtpStream,
};
use crate::{
    common::errors::VoiceError,
    configs::VoiceConfig,
    gateway::socket::{Connector, SocketRx, SocketTx, WireFrame},
    protocol::{Envelope, opcodes},
};

/// Signaling heartbeat for the voice WebSocket. Runs on its own task; the
/// write pump serializes it with other signaling frames.
fn spawn_heartbeat(
    tx: SocketTx,
    interval_ms: u64,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(interval_ms.max(1));
        // First beat one full interval after HELLO, not immediately.
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let beat = Envelope::new(opcodes::voice::HEARTBEAT, serde_json::Value::Null);
                    if tx.send_json(&beat).is_err() {
                        break; // Channel closed, session ending.
                    }
                }
            }
        }
    })
}

/// A live voice session: Ready state reached, pacer running. Dropping every
/// handle does not stop the session; the owning client (or `shutdown`) does.
pub struct VoiceConnection {
    ssrc: u32,
    external_ip: String,
    external_port: u16,
    mode: String,
    frames: flume::Sender<Vec<u8>>,
    feed: Arc<Notify>,
    state: watch::Receiver<VoiceState>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl VoiceConnection {
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Externally visible address learned from IP discovery.
    pub fn external_addr(&self) -> (&str, u16) {
        (&self.external_ip, self.external_port)
    }

    pub fn mode(&self) -> &str {
        &self.mode
    }

    pub fn state(&self) -> VoiceState {
        *self.state.borrow()
    }

    /// Queues one pre-encoded audio frame; waits while the buffer is full.
    /// The pacer transmits it on a frame boundary, never early.
    pub async fn play(&self, frame: Vec<u8>) -> Result<(), VoiceError> {
        self.frames
            .send_async(frame)
            .await
            .map_err(|_| VoiceError::Transport("voice session closed".into()))
    }

    /// Non-blocking variant; false when the buffer is full or closed.
    pub fn try_play(&self, frame: Vec<u8>) -> bool {
        self.frames.try_send(frame).is_ok()
    }

    /// Completes when the pacer's buffer dips under its target and wants
    /// more audio.
    pub async fn ready_for_more(&self) {
        self.feed.notified().await;
    }

    /// Cancels the session-scoped token (never the parent connection) and
    /// waits for the voice tasks to exit.
    pub(crate) async fn shutdown(&self) {
        self.cancel.cancel();
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
    }
}

/// Drives the voice signaling handshake:
/// Idle -> (READY + UDP discovery) Discovering -> (session description) Ready.
pub(crate) struct VoiceGateway {
    info: VoiceServerInfo,
    config: VoiceConfig,
    connector: Arc<dyn Connector>,
}

impl VoiceGateway {
    pub(crate) fn new(
        info: VoiceServerInfo,
        config: VoiceConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            info,
            config,
            connector,
        }
    }

    pub(crate) async fn connect(
        self,
        parent: &CancellationToken,
    ) -> Result<Arc<VoiceConnection>, VoiceError> {
        // Session-scoped child: cancelling it ends only the voice session,
        // cancelling the parent connection ends this too.
        let cancel = parent.child_token();
        match self.run_handshake(cancel.clone()).await {
            Ok(connection) => Ok(connection),
            Err(e) => {
                cancel.cancel();
                Err(e)
            }
        }
    }

    async fn run_handshake(
        &self,
        cancel: CancellationToken,
    ) -> Result<Arc<VoiceConnection>, VoiceError> {
        let url = format!("wss://{}/?v={}", self.info.endpoint, VOICE_GATEWAY_VERSION);
        debug!("[{}] connecting to voice gateway: {}", self.info.server_id, url);

        let (tx, mut rx) = self
            .connector
            .connect(&url, cancel.clone())
            .await
            .map_err(|e| VoiceError::Signaling(e.to_string()))?;

        self.send(&tx, opcodes::voice::IDENTIFY, self.identify_payload())?;

        let udp_socket = Arc::new(
            UdpSocket::bind("0.0.0.0:0")
                .await
                .map_err(|e| VoiceError::Transport(e.to_string()))?,
        );

        let (state_tx, state_rx) = watch::channel(VoiceState::Idle);
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let deadline = tokio::time::Instant::now() + timeout;

        let mut heartbeat_handle: Option<JoinHandle<()>> = None;
        let mut ssrc = 0u32;
        let mut udp_addr: Option<SocketAddr> = None;
        let mut external: Option<(String, u16)> = None;
        let mut mode = DEFAULT_VOICE_MODE.to_string();

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(VoiceError::Signaling("session cancelled during handshake".into()));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(VoiceError::HandshakeTimeout(timeout));
                }
                frame = rx.recv() => frame,
            };

            let text = match frame {
                Some(WireFrame::Text(text)) => text,
                Some(WireFrame::Binary(_)) => continue,
                Some(WireFrame::Close { code, reason }) => {
                    return Err(VoiceError::Signaling(format!(
                        "signaling closed during handshake: code={}, reason='{}'",
                        code, reason
                    )));
                }
                None => {
                    return Err(VoiceError::Signaling(
                        "signaling socket closed during handshake".into(),
                    ));
                }
            };

            let envelope: Envelope = match serde_json::from_str(&text) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(
                        "[{}] failed to parse voice frame: {} - text: {}",
                        self.info.server_id, e, text
                    );
                    continue;
                }
            };

            match envelope.op {
                opcodes::voice::HELLO => {
                    let interval = envelope.d["heartbeat_interval"]
                        .as_u64()
                        .unwrap_or(DEFAULT_VOICE_HEARTBEAT_MS);
                    debug!(
                        "[{}] voice heartbeat interval {}ms",
                        self.info.server_id, interval
                    );
                    if let Some(old) = heartbeat_handle.take() {
                        old.abort();
                    }
                    heartbeat_handle = Some(spawn_heartbeat(tx.clone(), interval, cancel.clone()));
                }
                opcodes::voice::READY => {
                    ssrc = envelope.d["ssrc"].as_u64().unwrap_or(0) as u32;
                    let ip = envelope.d["ip"].as_str().unwrap_or("");
                    let port = envelope.d["port"].as_u64().unwrap_or(0) as u16;
                    let addr: SocketAddr = format!("{}:{}", ip, port)
                        .parse()
                        .map_err(|_| VoiceError::Signaling(format!("bad voice endpoint {}:{}", ip, port)))?;
                    udp_addr = Some(addr);

                    if let Some(modes) = envelope.d["modes"].as_array() {
                        if let Some(found) = PREFERRED_MODES
                            .iter()
                            .find(|&&p| modes.iter().any(|m| m.as_str() == Some(p)))
                        {
                            mode = found.to_string();
                        }
                    }
                    debug!(
                        "[{}] voice ready: ssrc={}, udp={}, mode={}",
                        self.info.server_id, ssrc, addr, mode
                    );

                    let _ = state_tx.send(VoiceState::Discovering);
                    let discovered = discover_ip(
                        &udp_socket,
                        addr,
                        ssrc,
                        Duration::from_millis(self.config.discovery_timeout_ms),
                    )
                    .await?;
                    debug!(
                        "[{}] discovered external address {}:{}",
                        self.info.server_id, discovered.0, discovered.1
                    );

                    self.send(
                        &tx,
                        opcodes::voice::SELECT_PROTOCOL,
                        serde_json::json!({
                            "protocol": "udp",
                            "data": {
                                "address": discovered.0,
                                "port": discovered.1,
                                "mode": mode,
                            }
                        }),
                    )?;
                    external = Some(discovered);
                }
                opcodes::voice::SESSION_DESCRIPTION => {
                    if let Some(m) = envelope.d["mode"].as_str() {
                        mode = m.to_string();
                    }
                    break;
                }
                other => {
                    debug!(
                        "[{}] unhandled voice op {} during handshake",
                        self.info.server_id, other
                    );
                }
            }
        }

        let udp_addr = udp_addr
            .ok_or_else(|| VoiceError::Signaling("session description before ready".into()))?;
        let (external_ip, external_port) =
            external.ok_or_else(|| VoiceError::Signaling("discovery never completed".into()))?;

        let _ = state_tx.send(VoiceState::Ready);
        info!(
            "[{}] voice session ready: ssrc={}, mode={}",
            self.info.server_id, ssrc, mode
        );

        self.send(
            &tx,
            opcodes::voice::SPEAKING,
            serde_json::json!({ "speaking": 1, "delay": 0, "ssrc": ssrc }),
        )?;

        let buffer_frames = self.config.buffer_frames().max(1);
        let (frame_tx, frame_rx) = flume::bounded::<Vec<u8>>(buffer_frames * 2);
        let feed = Arc::new(Notify::new());

        let mut handles = Vec::new();
        handles.push(tokio::spawn(pace_loop(
            udp_socket,
            udp_addr,
            RtpStream::new(ssrc, self.config.samples_per_frame()),
            frame_rx,
            feed.clone(),
            Duration::from_millis(self.config.frame_duration_ms.max(1)),
            buffer_frames,
            cancel.clone(),
        )));
        if let Some(handle) = heartbeat_handle {
            handles.push(handle);
        }
        handles.push(tokio::spawn(run_signaling(
            rx,
            state_tx,
            self.info.server_id.clone(),
            cancel.clone(),
        )));

        Ok(Arc::new(VoiceConnection {
            ssrc,
            external_ip,
            external_port,
            mode,
            frames: frame_tx,
            feed,
            state: state_rx,
            cancel,
            handles: Mutex::new(handles),
        }))
    }

    fn identify_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "server_id": self.info.server_id,
            "user_id": self.info.user_id.to_string(),
            "session_id": self.info.session_id,
            "token": self.info.token,
        })
    }

    fn send(&self, tx: &SocketTx, op: u8, d: serde_json::Value) -> Result<(), VoiceError> {
        tx.send_json(&Envelope::new(op, d))
            .map_err(|e| VoiceError::Signaling(e.to_string()))
    }
}

/// Post-handshake signaling loop: keeps servicing inbound frames and turns
/// socket loss into a session-local stop, never touching the parent
/// connection.
async fn run_signaling(
    mut rx: SocketRx,
    state_tx: watch::Sender<VoiceState>,
    server_id: String,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => frame,
        };
        match frame {
            Some(WireFrame::Text(text)) => {
                if let Ok(envelope) = serde_json::from_str::<Envelope>(&text) {
                    debug!("[{}] voice op {} ignored", server_id, envelope.op);
                }
            }
            Some(WireFrame::Binary(_)) => {}
            Some(WireFrame::Close { code, reason }) => {
                warn!(
                    "[{}] voice signaling closed: code={}, reason='{}'",
                    server_id, code, reason
                );
                break;
            }
            None => {
                warn!("[{}] voice signaling socket closed", server_id);
                break;
            }
        }
    }
    let _ = state_tx.send(VoiceState::Idle);
    cancel.cancel();
}
