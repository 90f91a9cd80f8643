use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite};
use tracing::{info, warn};

use super::messages::ControlFrame;

/// Close code for a clean shutdown. Anything else schedules a reconnect.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Raw events pumped from the wire into the connection manager
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// One inbound text frame, not yet parsed
    Message(String),
    /// The transport closed with the given close code (if the peer sent one)
    Closed { code: Option<u16> },
}

/// One physical duplex connection.
///
/// `is_open` must report ground truth, not a cached flag: the manager
/// reconciles its own tracked flag against this on every liveness check.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Send a JSON control frame.
    async fn send(&self, frame: ControlFrame) -> anyhow::Result<()>;

    /// Whether the underlying connection is currently open and usable.
    fn is_open(&self) -> bool;

    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// Opens transport connections for a session id.
///
/// Injected into the manager so tests can run against scripted transports
/// and so multiple independent registries can coexist.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn open(
        &self,
        session_id: &str,
    ) -> anyhow::Result<(Box<dyn StreamTransport>, mpsc::Receiver<TransportEvent>)>;
}

/// WebSocket-backed connector: one socket per session, keyed by session id
/// in the URL path.
pub struct WsStreamConnector {
    base_url: String,
}

impl WsStreamConnector {
    /// `base_url` is the stream endpoint root, e.g. `wss://host/stream`;
    /// the session id is appended as the final path segment.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn session_url(&self, session_id: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), session_id)
    }
}

struct WsTransport {
    outbound: mpsc::Sender<tungstenite::Message>,
    open: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

#[async_trait]
impl StreamTransport for WsTransport {
    async fn send(&self, frame: ControlFrame) -> anyhow::Result<()> {
        if !self.is_open() {
            anyhow::bail!("websocket is closed");
        }
        self.outbound
            .send(tungstenite::Message::Text(frame.to_json().into()))
            .await
            .map_err(|_| anyhow::anyhow!("websocket writer task is gone"))
    }

    fn is_open(&self) -> bool {
        self.open.load(std::sync::atomic::Ordering::SeqCst) && !self.outbound.is_closed()
    }

    async fn close(&self) {
        self.open.store(false, std::sync::atomic::Ordering::SeqCst);
        // Dropping the last outbound sender ends the writer task, which
        // closes the sink. Send an explicit close frame if we still can.
        let _ = self
            .outbound
            .send(tungstenite::Message::Close(None))
            .await;
    }
}

#[async_trait]
impl StreamConnector for WsStreamConnector {
    async fn open(
        &self,
        session_id: &str,
    ) -> anyhow::Result<(Box<dyn StreamTransport>, mpsc::Receiver<TransportEvent>)> {
        let url = self.session_url(session_id);
        info!("opening transcript stream: {}", url);

        let (ws_stream, _) = connect_async(&url).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let open = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
        let (out_tx, mut out_rx) = mpsc::channel::<tungstenite::Message>(32);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(64);

        // Writer task: forward queued frames to the sink.
        let open_writer = open.clone();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, tungstenite::Message::Close(_));
                if ws_tx.send(msg).await.is_err() {
                    open_writer.store(false, std::sync::atomic::Ordering::SeqCst);
                    break;
                }
                if closing {
                    let _ = ws_tx.close().await;
                    break;
                }
            }
        });

        // Reader task: pump inbound frames and the close code to the manager.
        let open_reader = open.clone();
        let sid = session_id.to_string();
        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(tungstenite::Message::Text(text)) => {
                        if event_tx
                            .send(TransportEvent::Message(text.to_string()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(tungstenite::Message::Close(frame)) => {
                        let code = frame.map(|f| u16::from(f.code));
                        open_reader.store(false, std::sync::atomic::Ordering::SeqCst);
                        let _ = event_tx.send(TransportEvent::Closed { code }).await;
                        break;
                    }
                    Ok(_) => {
                        // Binary/ping/pong frames are transport plumbing.
                        continue;
                    }
                    Err(e) => {
                        warn!("websocket read error for session {}: {}", sid, e);
                        open_reader.store(false, std::sync::atomic::Ordering::SeqCst);
                        let _ = event_tx.send(TransportEvent::Closed { code: None }).await;
                        break;
                    }
                }
            }
            open_reader.store(false, std::sync::atomic::Ordering::SeqCst);
        });

        Ok((
            Box::new(WsTransport {
                outbound: out_tx,
                open,
            }),
            event_rx,
        ))
    }
}
