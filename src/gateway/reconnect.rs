use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};

use super::{DisconnectReason, backoff::Backoff};
use crate::{client::ClientInner, common::errors::GatewayError};

/// The reconnect supervisor: one long-lived task per client consuming
/// disconnect signals. Unexpected terminations tear down the dead attempt
/// and re-drive `connect` with the last known credentials under a doubling
/// backoff; expected ones do nothing. Because a single task owns the whole
/// episode, at most one reconnect attempt is ever in flight and concurrent
/// signals coalesce into it.
pub(crate) fn spawn_supervisor(
    client: Arc<ClientInner>,
    mut reasons: mpsc::UnboundedReceiver<DisconnectReason>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let root = client.root_token().clone();
        let mut backoff = Backoff::new(client.reconnect_config());
        loop {
            let reason = tokio::select! {
                _ = root.cancelled() => return,
                reason = reasons.recv() => match reason {
                    Some(reason) => reason,
                    None => return,
                },
            };

            if reason.is_expected() {
                continue;
            }
            warn!("unexpected disconnect: {}", reason.describe());
            client.teardown(reason).await;

            // An expected disconnect clears the stored credentials; their
            // absence is how a racing caller cancels this episode.
            if client.credentials().is_none() {
                continue;
            }

            // Delay resets to base at the start of each episode, i.e. after
            // any attempt that reached Connected.
            backoff.reset();
            loop {
                let delay = backoff.next();
                info!("reconnecting in {:?}", delay);
                tokio::select! {
                    _ = root.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                let Some(credentials) = client.credentials() else {
                    break;
                };
                match client
                    .connect(&credentials.gateway_url, &credentials.token)
                    .await
                {
                    Ok(()) => {
                        info!("reconnected to {}", credentials.gateway_url);
                        break;
                    }
                    // A caller-driven connect won the race; this episode is done.
                    Err(GatewayError::AlreadyConnected) => break,
                    Err(e) => warn!("reconnect attempt failed: {}", e),
                }
            }
        }
    })
}
