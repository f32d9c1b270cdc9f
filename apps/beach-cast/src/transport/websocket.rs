use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};
use url::Url;

use super::{Transport, TransportError, TransportEvent, TransportLink};

/// How long a closing link waits for its writer to hand back unsent frames.
const WRITER_STOP_GRACE: Duration = Duration::from_secs(2);

/// WebSocket implementation of [`Transport`]; every frame travels as one binary message.
#[derive(Debug, Default, Clone)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, url: &Url) -> TransportLink {
        let (tx_out, rx_out) = mpsc::unbounded_channel::<Bytes>();
        let (tx_events, rx_events) = mpsc::unbounded_channel::<TransportEvent>();
        let url = url.clone();

        tokio::spawn(async move {
            debug!(target: "beach_cast::transport", url = %redacted_url(&url), "connecting websocket");
            match connect_async(url.as_str()).await {
                Ok((ws_stream, _)) => {
                    if tx_events.send(TransportEvent::Open).is_err() {
                        return;
                    }
                    handle_websocket(ws_stream, rx_out, tx_events).await;
                }
                Err(err) => {
                    warn!(
                        target: "beach_cast::transport",
                        url = %redacted_url(&url),
                        error = %err,
                        "websocket connect failed"
                    );
                    let _ = tx_events.send(TransportEvent::Error(TransportError::Connect {
                        url: redacted_url(&url),
                        reason: err.to_string(),
                    }));
                    let _ = tx_events.send(TransportEvent::Closed {
                        reason: Some("connect failed".into()),
                    });
                }
            }
        });

        TransportLink {
            outgoing: tx_out,
            events: rx_events,
        }
    }
}

async fn handle_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<Bytes>,
    tx_events: mpsc::UnboundedSender<TransportEvent>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let send_events = tx_events.clone();
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let mut send_task = tokio::spawn(async move {
        let mut unsent = Vec::new();
        loop {
            let data = tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                data = rx_out.recv() => match data {
                    Some(data) => data,
                    None => break,
                },
            };
            if let Err(err) = ws_sender.send(Message::Binary(data.to_vec())).await {
                let _ = send_events.send(TransportEvent::Error(TransportError::WebSocket(
                    err.to_string(),
                )));
                unsent.push(data);
                break;
            }
        }
        rx_out.close();
        while let Ok(data) = rx_out.try_recv() {
            unsent.push(data);
        }
        let _ = ws_sender.close().await;
        unsent
    });

    let mut reason = None;
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                if tx_events.send(TransportEvent::Message(Bytes::from(data))).is_err() {
                    break;
                }
            }
            Ok(Message::Text(text)) => {
                if tx_events
                    .send(TransportEvent::Message(Bytes::from(text.into_bytes())))
                    .is_err()
                {
                    break;
                }
            }
            Ok(Message::Close(frame)) => {
                reason = frame.map(|frame| frame.reason.to_string());
                break;
            }
            Err(err) => {
                let _ = tx_events.send(TransportEvent::Error(TransportError::WebSocket(
                    err.to_string(),
                )));
                break;
            }
            Ok(other) => {
                trace!(target: "beach_cast::transport", kind = ?other, "ignoring control message");
            }
        }
    }

    let _ = stop_tx.send(());
    let unsent = match tokio::time::timeout(WRITER_STOP_GRACE, &mut send_task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            warn!(target: "beach_cast::transport", "websocket writer did not stop; its buffered frames are lost");
            send_task.abort();
            Vec::new()
        }
    };
    if !unsent.is_empty() {
        debug!(target: "beach_cast::transport", frames = unsent.len(), "returning unsent frames");
        let _ = tx_events.send(TransportEvent::Unsent(unsent));
    }
    let _ = tx_events.send(TransportEvent::Closed { reason });
}

/// Strips credentials from a connection url before it reaches the logs.
pub(crate) fn redacted_url(url: &Url) -> String {
    let mut clean = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| {
            let value = if key == "token" || key == "reconnect" {
                "***".to_string()
            } else {
                value.into_owned()
            };
            (key.into_owned(), value)
        })
        .collect();
    if pairs.is_empty() {
        return clean.to_string();
    }
    clean.query_pairs_mut().clear().extend_pairs(pairs);
    clean.to_string()
}
