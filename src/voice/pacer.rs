use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{net::UdpSocket, sync::Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{constants::SPIN_THRESHOLD_NANOS, rtp::RtpStream};

/// Frame-boundary schedule against a nanosecond stopwatch:
/// `ticks_per_frame = frequency / 1000 * frame_duration_ms`, with the
/// stopwatch frequency fixed at one tick per nanosecond.
pub(crate) struct FrameSchedule {
    ticks_per_frame: u64,
    next_ticks: u64,
}

impl FrameSchedule {
    pub(crate) fn new(frame_duration: Duration) -> Self {
        Self {
            ticks_per_frame: frame_duration.as_nanos().max(1) as u64,
            next_ticks: 0,
        }
    }

    /// True when the next frame boundary has passed; consumes exactly one
    /// boundary per call so a late caller can catch up boundary by boundary.
    pub(crate) fn due(&mut self, elapsed_ticks: u64) -> bool {
        if elapsed_ticks >= self.next_ticks {
            self.next_ticks += self.ticks_per_frame;
            true
        } else {
            false
        }
    }

    pub(crate) fn ticks_to_next(&self, elapsed_ticks: u64) -> u64 {
        self.next_ticks.saturating_sub(elapsed_ticks)
    }
}

/// The dedicated voice send loop. Transmits at most one queued packet per
/// frame boundary regardless of how fast the producer enqueues, because the
/// receiving decoder expects strictly periodic arrival. Near a boundary it
/// busy-polls the stopwatch; far from one it sleeps a millisecond at a time.
pub(crate) async fn pace_loop(
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
    mut rtp: RtpStream,
    frames: flume::Receiver<Vec<u8>>,
    feed: Arc<Notify>,
    frame_duration: Duration,
    buffer_frames: usize,
    cancel: CancellationToken,
) {
    let mut schedule = FrameSchedule::new(frame_duration);
    let stopwatch = Instant::now();
    let mut packet_buf: Vec<u8> = Vec::with_capacity(1500);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        // Below the buffer target, ask the producer for more audio.
        if frames.len() < buffer_frames {
            feed.notify_one();
        }

        let mut elapsed = stopwatch.elapsed().as_nanos() as u64;
        if schedule.ticks_to_next(elapsed) == 0 {
            // Consume every boundary that has passed. Sequence numbers move
            // only with transmitted packets; the timestamp moves every frame.
            while schedule.due(elapsed) {
                if let Ok(frame) = frames.try_recv() {
                    rtp.packetize(&frame, &mut packet_buf);
                    if let Err(e) = socket.send_to(&packet_buf, addr).await {
                        warn!("voice packet send failed: {}", e);
                    }
                }
                rtp.advance_frame();
                elapsed = stopwatch.elapsed().as_nanos() as u64;
            }
        } else if frames.is_empty() || schedule.ticks_to_next(elapsed) >= SPIN_THRESHOLD_NANOS {
            tokio::time::sleep(Duration::from_millis(1)).await;
        } else {
            // Final stretch before the boundary: poll the clock, stay
            // cooperative with the runtime.
            tokio::task::yield_now().await;
        }
    }

    debug!("voice send loop stopped");
}
