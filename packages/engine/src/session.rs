//! Session client.
//!
//! Maintains exactly one persistent connection to the hub's `/ws` endpoint:
//! reconnects with bounded exponential backoff, re-registers on every
//! reconnect, heartbeats the connection, and queues outbound messages in
//! FIFO order while disconnected. Implemented with `tokio-tungstenite`, run
//! as its own spawned task that owns the live connection — the same shape
//! `umbra-core`'s relay client would need natively instead of through a
//! browser WebSocket.

use std::collections::VecDeque;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::protocol::{ClientMessage, ServerMessage};

const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const MAX_BACKOFF_SECS: u64 = 30;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const PONG_DEADLINE: Duration = Duration::from_secs(60);
const INBOUND_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub name: String,
    pub device_type: String,
}

/// Handle to a running session. Cloning shares the same underlying
/// connection.
#[derive(Clone)]
pub struct SessionClient {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    inbound: broadcast::Sender<ServerMessage>,
}

impl SessionClient {
    /// Spawns the connect/reconnect/heartbeat loop and returns a handle.
    pub fn spawn(url: String, identity: DeviceIdentity) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, _) = broadcast::channel::<ServerMessage>(INBOUND_CHANNEL_CAPACITY);

        let driver_inbound = inbound_tx.clone();
        tokio::spawn(async move {
            driver(url, identity, outbound_rx, driver_inbound).await;
        });

        Self { outbound: outbound_tx, inbound: inbound_tx }
    }

    /// Enqueues a message for send. While disconnected it accumulates in
    /// the driver's FIFO queue and flushes on the next successful connect.
    pub fn send(&self, message: ClientMessage) {
        let _ = self.outbound.send(message);
    }

    /// Subscribes to inbound messages. `device-list` and `transfer-offer`
    /// are expected to go to UI subscribers; every other message to the
    /// Transfer Engine — callers decide which by matching on the variant.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.inbound.subscribe()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

async fn driver(
    url: String,
    identity: DeviceIdentity,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientMessage>,
    inbound_tx: broadcast::Sender<ServerMessage>,
) {
    let mut queue: VecDeque<ClientMessage> = VecDeque::new();
    let mut attempt: u32 = 0;

    loop {
        match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => {
                tracing::info!(url = url.as_str(), "session connected");
                attempt = 0;
                let (mut write, mut read) = ws_stream.split();

                let register = ClientMessage::DeviceRegister {
                    device_id: identity.device_id.clone(),
                    name: identity.name.clone(),
                    device_type: identity.device_type.clone(),
                };
                if send_one(&mut write, &register).await.is_err() {
                    continue;
                }

                while let Some(queued) = queue.pop_front() {
                    if send_one(&mut write, &queued).await.is_err() {
                        queue.push_front(queued);
                        break;
                    }
                }

                let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
                let mut last_pong = tokio::time::Instant::now();
                // A clean close (code 1000 normal, 1001 going away) ends the
                // session outright per §4.6; anything else reconnects.
                let mut clean_close = false;

                let disconnect_reason = 'conn: loop {
                    tokio::select! {
                        _ = heartbeat.tick() => {
                            if last_pong.elapsed() > PONG_DEADLINE {
                                tracing::warn!("heartbeat pong deadline exceeded, forcing reconnect");
                                break 'conn "half-open";
                            }
                            let ping = ClientMessage::Ping { timestamp: now_ms() };
                            if send_one(&mut write, &ping).await.is_err() {
                                break 'conn "send failed";
                            }
                        }
                        outgoing = outbound_rx.recv() => {
                            match outgoing {
                                Some(message) => {
                                    if send_one(&mut write, &message).await.is_err() {
                                        queue.push_back(message);
                                        break 'conn "send failed";
                                    }
                                }
                                None => break 'conn "client dropped",
                            }
                        }
                        incoming = read.next() => {
                            match incoming {
                                Some(Ok(WsMessage::Text(text))) => {
                                    match serde_json::from_str::<ServerMessage>(&text) {
                                        Ok(ServerMessage::Pong { .. }) => {
                                            last_pong = tokio::time::Instant::now();
                                        }
                                        Ok(other) => {
                                            let _ = inbound_tx.send(other);
                                        }
                                        Err(err) => {
                                            tracing::warn!(%err, "malformed server message");
                                        }
                                    }
                                }
                                Some(Ok(WsMessage::Close(frame))) => {
                                    let code = frame.as_ref().map(|f| u16::from(f.code));
                                    clean_close = matches!(code, Some(1000) | Some(1001));
                                    break 'conn "closed";
                                }
                                None => break 'conn "closed",
                                Some(Err(err)) => {
                                    tracing::warn!(%err, "websocket read error");
                                    break 'conn "error";
                                }
                                _ => {}
                            }
                        }
                    }
                };
                tracing::info!(reason = disconnect_reason, clean_close, "session disconnected");
                if clean_close {
                    tracing::info!("clean close, not reconnecting");
                    return;
                }
            }
            Err(err) => {
                tracing::warn!(%err, "connect attempt failed");
                // Drain anything queued during the failed attempt so it is
                // not lost before the next try.
                while let Ok(message) = outbound_rx.try_recv() {
                    queue.push_back(message);
                }
            }
        }

        attempt += 1;
        if attempt > MAX_RECONNECT_ATTEMPTS {
            tracing::error!("giving up after {} reconnect attempts", MAX_RECONNECT_ATTEMPTS);
            return;
        }
        let backoff = Duration::from_secs((1u64 << (attempt - 1)).min(MAX_BACKOFF_SECS));
        tracing::info!(attempt, backoff_secs = backoff.as_secs(), "scheduling reconnect");

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = async {
                loop {
                    match outbound_rx.recv().await {
                        Some(message) => queue.push_back(message),
                        None => std::future::pending::<()>().await,
                    }
                }
            } => {}
        }
    }
}

type WsSink = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;

async fn send_one(write: &mut WsSink, message: &ClientMessage) -> Result<(), ()> {
    let json = serde_json::to_string(message).map_err(|_| ())?;
    write.send(WsMessage::Text(json)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps_at_thirty_seconds() {
        let backoffs: Vec<u64> = (1..=6)
            .map(|attempt| (1u64 << (attempt - 1)).min(MAX_BACKOFF_SECS))
            .collect();
        assert_eq!(backoffs, vec![1, 2, 4, 8, 16, 30]);
    }

    #[test]
    fn only_normal_and_going_away_codes_are_clean() {
        let is_clean = |code: u16| matches!(Some(code), Some(1000) | Some(1001));
        assert!(is_clean(1000));
        assert!(is_clean(1001));
        assert!(!is_clean(1006));
        assert!(!is_clean(1011));
    }

    #[test]
    fn reconnect_attempts_are_bounded() {
        assert_eq!(MAX_RECONNECT_ATTEMPTS, 5);
    }
}
