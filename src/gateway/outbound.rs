use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{Session, heartbeat::HeartbeatClock, socket::SocketTx};
use crate::protocol::Envelope;

pub(crate) fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The combined send/heartbeat loop: drains the outgoing frame queue and, on
/// every iteration, emits a keepalive when one is due. Heartbeats are never
/// reordered relative to other outgoing frames because this is the only
/// writer on the socket.
pub(crate) async fn outbound_loop(
    socket: SocketTx,
    mut frames: mpsc::UnboundedReceiver<Envelope>,
    session: Arc<Session>,
    last_heartbeat_sent: Arc<AtomicU64>,
    poll: Duration,
    cancel: CancellationToken,
) {
    let mut clock = HeartbeatClock::new();

    'outer: loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll) => {}
            frame = frames.recv() => {
                match frame {
                    Some(frame) => {
                        if socket.send_json(&frame).is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }

        // Flush whatever else is already queued before the heartbeat check so
        // enqueue order hits the wire intact.
        while let Ok(frame) = frames.try_recv() {
            if socket.send_json(&frame).is_err() {
                break 'outer;
            }
        }

        clock.observe_interval(session.heartbeat_interval_ms());
        if clock.poll(Instant::now()) {
            last_heartbeat_sent.store(now_unix_ms(), Ordering::Relaxed);
            if socket.send_json(&Envelope::heartbeat()).is_err() {
                break;
            }
            trace!("heartbeat sent");
        }
    }

    debug!("outbound loop stopped");
}
