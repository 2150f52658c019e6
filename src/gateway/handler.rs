use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DisconnectReason, Session, outbound::now_unix_ms, socket::SocketRx};
use crate::{
    common::errors::GatewayError,
    gateway::socket::WireFrame,
    protocol::{ClientEvent, Envelope, opcodes},
};

enum NextFrame {
    Frame(WireFrame),
    Cancelled,
    Stale(Duration),
    Closed,
}

/// The receive loop. Parses inbound envelopes, feeds the READY handshake
/// back into the connect call, forwards other dispatches to the event
/// channel, and converts socket loss into a disconnect signal.
pub(crate) struct Dispatcher {
    pub socket: SocketRx,
    pub session: Arc<Session>,
    /// Present until READY; consumed to unblock the `connect()` caller.
    pub ready: Option<oneshot::Sender<Result<(), GatewayError>>>,
    pub reasons: mpsc::UnboundedSender<DisconnectReason>,
    pub events: mpsc::UnboundedSender<ClientEvent>,
    pub last_heartbeat_sent: Arc<AtomicU64>,
    pub ping_ms: Arc<AtomicI64>,
    pub stale_multiplier: u32,
    pub cancel: CancellationToken,
}

impl Dispatcher {
    pub async fn run(mut self) {
        loop {
            let frame = match self.next_frame().await {
                NextFrame::Frame(frame) => frame,
                NextFrame::Cancelled => {
                    debug!("dispatcher stopped");
                    return;
                }
                NextFrame::Stale(age) => {
                    warn!("no server traffic for {:?}, treating connection as dead", age);
                    return self.finish(GatewayError::Stale(age));
                }
                NextFrame::Closed => {
                    debug!("gateway stream ended");
                    return self.finish(GatewayError::SocketClosed("stream ended".into()));
                }
            };

            match frame {
                WireFrame::Text(text) => self.handle_text(&text),
                WireFrame::Binary(bin) => {
                    debug!("ignoring {}-byte binary frame", bin.len());
                }
                WireFrame::Close { code, reason } => {
                    info!("gateway closed: code={}, reason='{}'", code, reason);
                    let _ = self.events.send(ClientEvent::GatewayClosed {
                        code,
                        reason: reason.clone(),
                    });
                    return self.finish(GatewayError::ServerClose { code, reason });
                }
            }
        }
    }

    /// Receives one frame. Once the heartbeat interval is known, the read
    /// timeout is what turns total server silence into an
    /// unexpected-disconnect signal; individual missed heartbeats are not
    /// themselves fatal.
    async fn next_frame(&mut self) -> NextFrame {
        let interval_ms = self.session.heartbeat_interval_ms();
        if interval_ms > 0 {
            let deadline = Duration::from_millis(interval_ms * self.stale_multiplier as u64);
            tokio::select! {
                _ = self.cancel.cancelled() => NextFrame::Cancelled,
                received = tokio::time::timeout(deadline, self.socket.recv()) => match received {
                    Err(_) => NextFrame::Stale(deadline),
                    Ok(Some(frame)) => NextFrame::Frame(frame),
                    Ok(None) => NextFrame::Closed,
                }
            }
        } else {
            tokio::select! {
                _ = self.cancel.cancelled() => NextFrame::Cancelled,
                received = self.socket.recv() => match received {
                    Some(frame) => NextFrame::Frame(frame),
                    None => NextFrame::Closed,
                }
            }
        }
    }

    fn handle_text(&mut self, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("failed to parse gateway frame: {} - text: {}", e, text);
                return;
            }
        };

        match envelope.op {
            opcodes::gateway::DISPATCH => self.handle_dispatch(envelope),
            opcodes::gateway::HEARTBEAT_ACK => self.handle_heartbeat_ack(),
            other => debug!("unhandled gateway op {}: {:?}", other, envelope.d),
        }
    }

    fn handle_dispatch(&mut self, envelope: Envelope) {
        let t = envelope.t.unwrap_or_default();
        if t == opcodes::EVENT_READY {
            let interval = envelope.d["heartbeat_interval"].as_u64().unwrap_or(0);
            if interval == 0 {
                let err = GatewayError::Protocol("READY missing heartbeat_interval".into());
                warn!("{}", err);
                if let Some(tx) = self.ready.take() {
                    let _ = tx.send(Err(err));
                }
                return;
            }
            self.session.set_heartbeat_interval(interval);
            debug!("READY received; heartbeat interval {}ms", interval);
            if let Some(tx) = self.ready.take() {
                let _ = tx.send(Ok(()));
            }
        } else {
            let _ = self.events.send(ClientEvent::Dispatch { t, d: envelope.d });
        }
    }

    fn handle_heartbeat_ack(&self) {
        let sent_ms = self.last_heartbeat_sent.load(Ordering::Relaxed);
        if sent_ms > 0 {
            let latency = now_unix_ms().saturating_sub(sent_ms);
            self.ping_ms.store(latency as i64, Ordering::Relaxed);
        }
    }

    /// Terminal error path. Before READY the error belongs to the blocked
    /// `connect()` caller; afterwards it goes to the reconnect supervisor.
    /// Either way it lands on exactly one waiter's side.
    fn finish(mut self, err: GatewayError) {
        if let Some(tx) = self.ready.take() {
            let _ = tx.send(Err(err));
        } else {
            let _ = self
                .reasons
                .send(DisconnectReason::Unexpected { source: err });
        }
    }
}
