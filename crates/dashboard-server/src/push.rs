//! Push channel: envelopes, the broadcast hub and per-subscriber pacing

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_io::Timer;
use async_net::TcpStream;
use async_tungstenite::WebSocketStream;
use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt, StreamExt};
use futures_lite::future;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};
use tungstenite::Message;

/// At most one registry and one health frame per subscriber per window
const STATE_WINDOW: Duration = Duration::from_millis(200);

/// Log frames carry at least one line, at most every window
const LOG_WINDOW: Duration = Duration::from_millis(50);

/// Capacity of each subscriber's feed; overflow drops the subscriber's
/// oldest pending payloads rather than blocking the producers
const SUBSCRIBER_CAPACITY: usize = 256;

/// Wire envelope for every push-channel message
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    /// "registry", "health" or "log"
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// When the envelope was created
    pub timestamp: DateTime<Utc>,
    /// Message body, shaped per kind
    pub payload: Value,
}

impl Envelope {
    /// Build an envelope stamped now
    pub fn new(kind: &'static str, payload: Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Fan-out point between the state watchers and the connections
#[derive(Default)]
pub struct Hub {
    subscribers: Mutex<Vec<async_channel::Sender<Envelope>>>,
}

impl Hub {
    /// Register a new subscriber feed
    pub fn subscribe(&self) -> async_channel::Receiver<Envelope> {
        self.subscribe_seeded(None)
    }

    /// Register a subscriber, optionally priming it with an initial state
    /// frame so a fresh client renders without waiting for a change
    pub fn subscribe_seeded(&self, seed: Option<Envelope>) -> async_channel::Receiver<Envelope> {
        let (tx, rx) = async_channel::bounded(SUBSCRIBER_CAPACITY);
        if let Some(envelope) = seed {
            let _ = tx.try_send(envelope);
        }
        self.subscribers.lock().expect("hub mutex").push(tx);
        rx
    }

    /// Broadcast to every live subscriber, dropping the slow ones' backlog
    pub fn broadcast(&self, envelope: Envelope) {
        let mut subscribers = self.subscribers.lock().expect("hub mutex");
        subscribers.retain(|tx| match tx.try_send(envelope.clone()) {
            Ok(()) => true,
            Err(async_channel::TrySendError::Full(_)) => {
                // Non-blocking send with drop-on-full: the subscriber keeps
                // its connection but loses this frame.
                trace!("push subscriber full, dropping frame");
                true
            }
            Err(async_channel::TrySendError::Closed(_)) => false,
        });
    }

    /// Number of live subscribers
    pub fn len(&self) -> usize {
        self.subscribers.lock().expect("hub mutex").len()
    }

    /// Whether anyone is connected
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disconnect everyone
    pub fn close(&self) {
        for tx in self.subscribers.lock().expect("hub mutex").drain(..) {
            tx.close();
        }
    }
}

/// Drive one WebSocket connection until it closes
///
/// Envelopes from the hub are coalesced per the rate rules: the freshest
/// registry and health payloads are kept and flushed at most once per
/// 200 ms window, log lines are batched into one frame per 50 ms window.
pub async fn run_connection(
    ws: WebSocketStream<TcpStream>,
    feed: async_channel::Receiver<Envelope>,
) {
    let (mut sink, mut stream) = ws.split();

    let mut pending_registry: Option<Envelope> = None;
    let mut pending_health: Option<Envelope> = None;
    let mut pending_logs: Vec<Value> = Vec::new();
    let long_ago = Instant::now()
        .checked_sub(STATE_WINDOW)
        .unwrap_or_else(Instant::now);
    let mut last_state_flush = long_ago;
    let mut last_log_flush = long_ago;

    enum Tick {
        Feed(Option<Envelope>),
        Client(Option<Result<Message, tungstenite::Error>>),
        Flush,
    }

    loop {
        let tick = {
            let feed_next = async { Tick::Feed(feed.recv().await.ok()) };
            let client_next = async { Tick::Client(stream.next().await) };
            let flush = async {
                Timer::after(LOG_WINDOW).await;
                Tick::Flush
            };
            future::or(feed_next, future::or(client_next, flush)).await
        };

        match tick {
            Tick::Feed(Some(envelope)) => match envelope.kind {
                // Only the freshest snapshot matters within a window.
                "registry" => pending_registry = Some(envelope),
                "health" => pending_health = Some(envelope),
                _ => pending_logs.push(envelope.payload),
            },
            Tick::Feed(None) => {
                // Hub closed: flush what we have and say goodbye.
                let _ = flush_pending(
                    &mut sink,
                    &mut pending_registry,
                    &mut pending_health,
                    &mut pending_logs,
                )
                .await;
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            Tick::Client(Some(Ok(Message::Ping(data)))) => {
                if sink.send(Message::Pong(data)).await.is_err() {
                    break;
                }
            }
            Tick::Client(Some(Ok(Message::Close(_)))) | Tick::Client(None) => {
                debug!("push client disconnected");
                break;
            }
            Tick::Client(Some(Ok(_))) => {
                // The push channel is one-way; client text is ignored.
            }
            Tick::Client(Some(Err(e))) => {
                debug!("push client error: {}", e);
                break;
            }
            Tick::Flush => {}
        }

        let now = Instant::now();
        if !pending_logs.is_empty() && now.duration_since(last_log_flush) >= LOG_WINDOW {
            let batch = Envelope::new("log", Value::Array(std::mem::take(&mut pending_logs)));
            if send_envelope(&mut sink, &batch).await.is_err() {
                break;
            }
            last_log_flush = now;
        }
        if now.duration_since(last_state_flush) >= STATE_WINDOW {
            let mut sent = false;
            if let Some(envelope) = pending_registry.take() {
                if send_envelope(&mut sink, &envelope).await.is_err() {
                    break;
                }
                sent = true;
            }
            if let Some(envelope) = pending_health.take() {
                if send_envelope(&mut sink, &envelope).await.is_err() {
                    break;
                }
                sent = true;
            }
            if sent {
                last_state_flush = now;
            }
        }
    }
}

async fn flush_pending<S>(
    sink: &mut S,
    registry: &mut Option<Envelope>,
    health: &mut Option<Envelope>,
    logs: &mut Vec<Value>,
) -> Result<(), tungstenite::Error>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    if !logs.is_empty() {
        let batch = Envelope::new("log", Value::Array(std::mem::take(logs)));
        send_envelope(sink, &batch).await?;
    }
    if let Some(envelope) = registry.take() {
        send_envelope(sink, &envelope).await?;
    }
    if let Some(envelope) = health.take() {
        send_envelope(sink, &envelope).await?;
    }
    Ok(())
}

async fn send_envelope<S>(sink: &mut S, envelope: &Envelope) -> Result<(), tungstenite::Error>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(envelope).unwrap_or_else(|_| "{}".to_string());
    sink.send(Message::Text(json.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope::new("registry", serde_json::json!([{"name": "web"}]));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "registry");
        assert!(json["timestamp"].is_string());
        assert_eq!(json["payload"][0]["name"], "web");
    }

    #[smol_potat::test]
    async fn test_hub_broadcast_and_drop() {
        let hub = Hub::default();
        let rx = hub.subscribe();
        assert_eq!(hub.len(), 1);

        hub.broadcast(Envelope::new("registry", Value::Null));
        assert_eq!(rx.recv().await.unwrap().kind, "registry");

        drop(rx);
        hub.broadcast(Envelope::new("registry", Value::Null));
        assert!(hub.is_empty());
    }
}
