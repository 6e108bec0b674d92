use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::protocol::{AuthPayload, ClientRequest, ServerEvent};
use tokio::{
    net::TcpStream,
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

const TRANSPORT_EVENT_CAPACITY: usize = 256;

/// What a live transport session reports upward.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(ServerEvent),
    Closed(String),
    Error(String),
}

pub struct TransportLink {
    pub session: Arc<dyn TransportSession>,
    pub events: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn emit(&self, request: ClientRequest) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, endpoint: &str, auth: &AuthPayload) -> Result<TransportLink>;
}

pub struct MissingTransportConnector;

#[async_trait]
impl TransportConnector for MissingTransportConnector {
    async fn connect(&self, endpoint: &str, _auth: &AuthPayload) -> Result<TransportLink> {
        Err(anyhow!("realtime transport unavailable for endpoint {endpoint}"))
    }
}

pub fn websocket_url(endpoint: &str) -> Result<Url> {
    let mut url =
        Url::parse(endpoint).with_context(|| format!("invalid realtime endpoint: {endpoint}"))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(anyhow!(
                "realtime endpoint must use http(s) or ws(s), got '{other}'"
            ))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot rewrite scheme of realtime endpoint {endpoint}"))?;
    Ok(url)
}

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// JSON-over-websocket transport. Frames are `{type, payload}` objects in
/// both directions; the first outbound frame carries the auth payload.
#[derive(Default)]
pub struct WsTransportConnector;

impl WsTransportConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportConnector for WsTransportConnector {
    async fn connect(&self, endpoint: &str, auth: &AuthPayload) -> Result<TransportLink> {
        let ws_url = websocket_url(endpoint)?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (mut writer, mut reader) = ws_stream.split();

        let auth_frame = serde_json::to_string(&ClientRequest::Authenticate(auth.clone()))?;
        writer
            .send(Message::Text(auth_frame))
            .await
            .context("failed to send auth payload")?;

        let (tx, rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if tx.send(TransportEvent::Message(event)).await.is_err() {
                                return;
                            }
                        }
                        Err(error) => {
                            warn!(%error, "transport: dropping undecodable frame");
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|frame| frame.reason.to_string())
                            .filter(|reason| !reason.is_empty())
                            .unwrap_or_else(|| "server closed the connection".to_string());
                        let _ = tx.send(TransportEvent::Closed(reason)).await;
                        return;
                    }
                    Ok(_) => {}
                    Err(error) => {
                        let _ = tx
                            .send(TransportEvent::Error(format!(
                                "websocket receive failed: {error}"
                            )))
                            .await;
                        return;
                    }
                }
            }
            let _ = tx
                .send(TransportEvent::Closed("websocket stream ended".to_string()))
                .await;
        });

        Ok(TransportLink {
            session: Arc::new(WsTransportSession {
                writer: Mutex::new(writer),
                reader_task,
            }),
            events: rx,
        })
    }
}

struct WsTransportSession {
    writer: Mutex<WsWriter>,
    reader_task: JoinHandle<()>,
}

#[async_trait]
impl TransportSession for WsTransportSession {
    async fn emit(&self, request: ClientRequest) -> Result<()> {
        let event_name = request.event_name();
        let frame = serde_json::to_string(&request)?;
        self.writer
            .lock()
            .await
            .send(Message::Text(frame))
            .await
            .with_context(|| format!("failed to emit {event_name}"))?;
        debug!(event = event_name, "transport: emitted");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let result = self.writer.lock().await.close().await;
        self.reader_task.abort();
        result.context("failed to close websocket")
    }
}

impl Drop for WsTransportSession {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
