use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{common::errors::GatewayError, protocol::Envelope};

/// One raw frame on the wire, decoupled from the underlying WebSocket
/// library so tests can drive a connection without a network.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Write half of a transport socket. Clonable; sends are serialized by the
/// single write pump on the other side of the channel.
#[derive(Clone)]
pub struct SocketTx {
    tx: mpsc::UnboundedSender<WireFrame>,
}

impl SocketTx {
    pub fn send(&self, frame: WireFrame) -> Result<(), GatewayError> {
        self.tx
            .send(frame)
            .map_err(|_| GatewayError::SocketClosed("write channel closed".into()))
    }

    pub fn send_json(&self, envelope: &Envelope) -> Result<(), GatewayError> {
        self.send(WireFrame::Text(envelope.to_json()))
    }
}

/// Read half of a transport socket. `recv` returning `None` is the closed
/// signal: the peer hung up, the socket errored, or the attempt was
/// cancelled.
pub struct SocketRx {
    rx: mpsc::UnboundedReceiver<WireFrame>,
}

impl SocketRx {
    pub async fn recv(&mut self) -> Option<WireFrame> {
        self.rx.recv().await
    }
}

/// Seam between the connection state machine and the physical socket.
/// Production uses [`WsConnector`]; tests use an in-memory pair.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a socket to `url`. The returned halves stay live until the peer
    /// closes, an I/O error occurs, or `cancel` fires.
    async fn connect(
        &self,
        url: &str,
        cancel: CancellationToken,
    ) -> Result<(SocketTx, SocketRx), GatewayError>;
}

/// Production connector over `tokio-tungstenite`. Two pump tasks bridge the
/// split WebSocket halves onto plain channels; both observe `cancel`.
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        url: &str,
        cancel: CancellationToken,
    ) -> Result<(SocketTx, SocketRx), GatewayError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WireFrame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<WireFrame>();

        let write_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = write_cancel.cancelled() => break,
                    frame = out_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let msg = match frame {
                            WireFrame::Text(text) => Message::Text(text.into()),
                            WireFrame::Binary(bin) => Message::Binary(bin.into()),
                            WireFrame::Close { .. } => Message::Close(None),
                        };
                        if let Err(e) = write.send(msg).await {
                            warn!("WS write error: {}", e);
                            break;
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = read.next() => {
                        let msg = match msg {
                            Some(Ok(msg)) => msg,
                            Some(Err(e)) => {
                                debug!("WS read error: {}", e);
                                break;
                            }
                            None => break,
                        };
                        let frame = match msg {
                            Message::Text(text) => WireFrame::Text(text.to_string()),
                            Message::Binary(bin) => WireFrame::Binary(bin.to_vec()),
                            Message::Close(frame) => {
                                let (code, reason) = frame
                                    .map(|cf| (cf.code.into(), cf.reason.to_string()))
                                    .unwrap_or((1000u16, String::new()));
                                let _ = in_tx.send(WireFrame::Close { code, reason });
                                break;
                            }
                            // Ping/pong are answered by the library.
                            _ => continue,
                        };
                        if in_tx.send(frame).is_err() {
                            break;
                        }
                    }
                }
            }
            // Dropping `in_tx` closes the incoming channel; readers observe
            // the closed signal as `recv() == None`.
        });

        Ok((SocketTx { tx: out_tx }, SocketRx { rx: in_rx }))
    }
}
