//! WebSocket transport speaking JSON text frames to the signaling relay.

use super::{Transport, TransportEvent, TransportFactory};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// One live WebSocket connection to the relay.
pub struct WebSocketTransport {
    ws_sink: Mutex<Option<WsSink>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, frame: &[u8]) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("socket is closed"))?;

        let text = std::str::from_utf8(frame)
            .map_err(|e| anyhow::anyhow!("signaling frame is not valid UTF-8: {e}"))?;

        debug!(target: "Transport/Ws", "--> sending frame: {} bytes", frame.len());
        sink.send(Message::text(text))
            .await
            .map_err(|e| anyhow::anyhow!("websocket send error: {e}"))?;
        Ok(())
    }

    async fn disconnect(&self) {
        let mut sink_guard = self.ws_sink.lock().await;
        if let Some(mut sink) = sink_guard.take() {
            let _ = sink.close().await;
        }
    }
}

/// Factory dialing a fixed relay URL.
pub struct WebSocketTransportFactory {
    url: String,
}

impl WebSocketTransportFactory {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl TransportFactory for WebSocketTransportFactory {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        debug!(target: "Transport/Ws", "Dialing {}", self.url);
        let (ws, _response) = connect_async(&self.url)
            .await
            .map_err(|e| anyhow::anyhow!("websocket connect failed: {e}"))?;

        let (sink, stream) = ws.split();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let transport = Arc::new(WebSocketTransport {
            ws_sink: Mutex::new(Some(sink)),
        });

        tokio::spawn(read_pump(stream, event_tx.clone()));
        let _ = event_tx.send(TransportEvent::Connected).await;

        Ok((transport, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    loop {
        match stream.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(_) | Message::Binary(_) => {
                    let data = msg.into_data();
                    trace!(target: "Transport/Ws", "<-- received frame: {} bytes", data.len());
                    if event_tx
                        .send(TransportEvent::FrameReceived(data))
                        .await
                        .is_err()
                    {
                        warn!(target: "Transport/Ws", "Event receiver dropped, closing read pump");
                        return;
                    }
                }
                Message::Close(_) => {
                    trace!(target: "Transport/Ws", "Received close frame");
                    break;
                }
                // Ping/pong are handled by tungstenite itself.
                _ => {}
            },
            Some(Err(e)) => {
                error!(target: "Transport/Ws", "Error reading from websocket: {e}");
                break;
            }
            None => {
                trace!(target: "Transport/Ws", "Websocket stream ended");
                break;
            }
        }
    }

    let _ = event_tx.send(TransportEvent::Disconnected).await;
}
