//! Transfer engine.
//!
//! One state machine per transfer id: offer → accept → negotiate → stream →
//! complete, with a 3s negotiation timeout, fallback to relay upload, and
//! duplicate suppression. Per §5, the engine's per-process state lives in a
//! `HashMap<String, TransferHandle>` behind one `tokio::sync::Mutex`; each
//! transfer's actual lifecycle runs on its own dedicated task reached by
//! message-passing, so no transfer's negotiation ever blocks another's.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, Mutex};
use uuid::Uuid;

use crate::error::EngineError;
use crate::peer::{PeerEvent, PeerSession};
use crate::protocol::{ChunkMessage, ClientMessage, ServerMessage};
use crate::relay_client::RelayClient;
use crate::save_handler::SaveHandler;
use crate::session::SessionClient;

/// 16 KiB, per §4.5 step 5.
const CHUNK_SIZE: usize = 16 * 1024;
/// Yield every 10 chunks to avoid saturating the data channel.
const YIELD_EVERY_N_CHUNKS: usize = 10;
const YIELD_DURATION: Duration = Duration::from_millis(10);
/// Peer-connection open timeout before falling back to relay.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(3);
/// Sticky-flag cool-downs (§4.5 "Duplicate suppression").
const FALLBACK_COOLDOWN: Duration = Duration::from_secs(5);
const DOWNLOAD_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    Connecting,
    Connected,
    Transferring,
    Completed,
    Failed,
    Rejected,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Failed | TransferState::Rejected)
    }
}

/// Rounds `done/total` to the nearest whole percent (half-up), matching the
/// spec's own worked example of 3 chunks reporting 33, 67, 100 rather than
/// the truncated 33, 66, 100 a plain integer division would give.
fn round_progress(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (((done * 100) + total / 2) / total).min(100) as u8
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    Progress { transfer_id: String, progress: u8 },
    StateChanged { transfer_id: String, state: TransferState },
    Failed { transfer_id: String, message: String },
}

/// A file offered to a receiver. Held in memory for the lifetime of the
/// sender-side transfer; this crate has no file-system concerns (§1).
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub file_name: String,
    pub file_type: String,
    pub bytes: Bytes,
}

/// Known metadata for an inbound offer, supplied by the UI layer when the
/// user accepts (the UI is the one that received `transfer-offer`; the
/// engine never sees it directly per §4.6's dispatch rule).
#[derive(Debug, Clone)]
pub struct IncomingOffer {
    pub transfer_id: String,
    pub sender_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
}

struct TransferHandle {
    inbound: mpsc::UnboundedSender<ServerMessage>,
}

pub struct TransferEngine {
    session: SessionClient,
    relay: RelayClient,
    save_handler: Arc<dyn SaveHandler>,
    handles: Mutex<HashMap<String, TransferHandle>>,
    events: broadcast::Sender<TransferEvent>,
}

impl TransferEngine {
    pub fn new(
        session: SessionClient,
        relay: RelayClient,
        save_handler: Arc<dyn SaveHandler>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let engine = Arc::new(Self {
            session,
            relay,
            save_handler,
            handles: Mutex::new(HashMap::new()),
            events,
        });

        let dispatch_engine = engine.clone();
        tokio::spawn(async move {
            dispatch_engine.run_dispatch_loop().await;
        });

        engine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Sender path step 1: mint a transfer id and kick off the offer.
    pub async fn send_file(self: &Arc<Self>, receiver_id: String, file: OutgoingFile) -> String {
        let transfer_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.handles.lock().await.insert(transfer_id.clone(), TransferHandle { inbound: tx });

        let engine = self.clone();
        let transfer_id_task = transfer_id.clone();
        tokio::spawn(async move {
            engine.run_sender(transfer_id_task, receiver_id, file, rx).await;
        });

        transfer_id
    }

    /// Receiver path step 1 continuation: the UI decided to accept an
    /// offer it surfaced itself.
    pub async fn accept(self: &Arc<Self>, offer: IncomingOffer) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.handles
            .lock()
            .await
            .insert(offer.transfer_id.clone(), TransferHandle { inbound: tx });

        self.session.send(ClientMessage::TransferAnswer {
            transfer_id: offer.transfer_id.clone(),
            accepted: true,
        });

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_receiver(offer, rx).await;
        });
    }

    /// Receiver path step 1, reject branch.
    pub fn reject(&self, transfer_id: &str) {
        self.session.send(ClientMessage::TransferAnswer {
            transfer_id: transfer_id.to_string(),
            accepted: false,
        });
    }

    /// Reads every inbound server message and routes it to the owning
    /// transfer's dedicated task by id. Unroutable (unknown transfer id)
    /// negotiation messages are refused per the resolved open question in
    /// §9 — logged, dropped, no state created on the fly.
    async fn run_dispatch_loop(self: Arc<Self>) {
        let mut inbound = self.session.subscribe();
        loop {
            match inbound.recv().await {
                Ok(message) => {
                    if let Some(transfer_id) = transfer_id_of(&message) {
                        let handles = self.handles.lock().await;
                        if let Some(handle) = handles.get(transfer_id) {
                            let _ = handle.inbound.send(message);
                        } else {
                            tracing::warn!(transfer_id = %transfer_id, "message for unknown transfer, refusing");
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "transfer engine dispatch lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }

    async fn run_sender(
        self: Arc<Self>,
        transfer_id: String,
        receiver_id: String,
        file: OutgoingFile,
        mut inbound: mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        self.emit(TransferEvent::StateChanged { transfer_id: transfer_id.clone(), state: TransferState::Pending });
        self.session.send(ClientMessage::TransferOffer {
            transfer_id: transfer_id.clone(),
            file_name: file.file_name.clone(),
            file_size: file.bytes.len() as u64,
            file_type: file.file_type.clone(),
            receiver_id: receiver_id.clone(),
        });

        let accepted = loop {
            match inbound.recv().await {
                Some(ServerMessage::TransferAnswer { accepted, .. }) => break accepted,
                Some(_) => continue,
                None => return,
            }
        };

        if !accepted {
            self.emit(TransferEvent::StateChanged { transfer_id, state: TransferState::Rejected });
            return;
        }

        self.emit(TransferEvent::StateChanged { transfer_id: transfer_id.clone(), state: TransferState::Connecting });

        let fallback_triggered = Arc::new(AtomicBool::new(false));
        let mut peer = match PeerSession::new().await {
            Ok(peer) => peer,
            Err(err) => {
                tracing::warn!(transfer_id = %transfer_id, %err, "failed to create peer session, falling back");
                self.fallback(&transfer_id, &file, &fallback_triggered).await;
                return;
            }
        };

        let offer_sdp = match peer.create_offer().await {
            Ok(sdp) => sdp,
            Err(err) => {
                tracing::warn!(transfer_id = %transfer_id, %err, "offer creation failed, falling back");
                self.fallback(&transfer_id, &file, &fallback_triggered).await;
                return;
            }
        };
        self.session.send(ClientMessage::WebrtcOffer { transfer_id: transfer_id.clone(), sdp: offer_sdp });

        let negotiation_deadline = tokio::time::sleep(NEGOTIATION_TIMEOUT);
        tokio::pin!(negotiation_deadline);

        let data_channel_open = loop {
            tokio::select! {
                _ = &mut negotiation_deadline => break false,
                event = peer.events.recv() => {
                    match event {
                        Some(PeerEvent::DataChannelOpen) => break true,
                        Some(PeerEvent::ConnectionFailed) => break false,
                        Some(PeerEvent::IceCandidate(candidate)) => {
                            self.session.send(ClientMessage::WebrtcIceCandidate {
                                transfer_id: transfer_id.clone(),
                                candidate,
                            });
                        }
                        _ => {}
                    }
                }
                message = inbound.recv() => {
                    match message {
                        Some(ServerMessage::WebrtcAnswer { sdp, .. }) => {
                            if let Err(err) = peer.set_remote_answer(sdp).await {
                                tracing::warn!(transfer_id = %transfer_id, %err, "failed to apply remote answer");
                                break false;
                            }
                        }
                        Some(ServerMessage::WebrtcIceCandidate { candidate, .. }) => {
                            let _ = peer.add_ice_candidate(candidate).await;
                        }
                        Some(_) => {}
                        None => break false,
                    }
                }
            }
        };

        if !data_channel_open {
            let _ = peer.close().await;
            self.emit(TransferEvent::StateChanged { transfer_id: transfer_id.clone(), state: TransferState::Connecting });
            self.fallback(&transfer_id, &file, &fallback_triggered).await;
            return;
        }

        self.emit(TransferEvent::StateChanged { transfer_id: transfer_id.clone(), state: TransferState::Transferring });
        if let Err(err) = self.stream_file(&transfer_id, &peer, &file).await {
            tracing::warn!(transfer_id = %transfer_id, %err, "peer stream failed, falling back");
            self.fallback(&transfer_id, &file, &fallback_triggered).await;
            return;
        }

        self.session.send(ClientMessage::TransferComplete { transfer_id: transfer_id.clone() });
        self.emit(TransferEvent::StateChanged { transfer_id, state: TransferState::Completed });
    }

    async fn stream_file(
        &self,
        transfer_id: &str,
        peer: &PeerSession,
        file: &OutgoingFile,
    ) -> Result<(), EngineError> {
        let total_chunks = file.bytes.len().div_ceil(CHUNK_SIZE).max(1) as u32;
        let metadata = ChunkMessage::Metadata {
            file_name: file.file_name.clone(),
            file_size: file.bytes.len() as u64,
            file_type: file.file_type.clone(),
            total_chunks,
        };
        peer.send(&serde_json::to_vec(&metadata)?).await?;

        for (index, chunk) in file.bytes.chunks(CHUNK_SIZE).enumerate() {
            let envelope = ChunkMessage::Chunk { index: index as u32, data: chunk.to_vec() };
            peer.send(&serde_json::to_vec(&envelope)?).await?;

            let progress = round_progress((index + 1) as u64, total_chunks as u64);
            self.emit(TransferEvent::Progress { transfer_id: transfer_id.to_string(), progress });
            self.session.send(ClientMessage::TransferProgress {
                transfer_id: transfer_id.to_string(),
                progress,
            });

            if (index + 1) % YIELD_EVERY_N_CHUNKS == 0 {
                tokio::time::sleep(YIELD_DURATION).await;
            }
        }
        Ok(())
    }

    /// Sender-side fallback: idempotent relay upload, guarded by a sticky
    /// per-transfer flag so negotiation failure and the 3s timeout can
    /// never both trigger it.
    async fn fallback(
        &self,
        transfer_id: &str,
        file: &OutgoingFile,
        triggered: &Arc<AtomicBool>,
    ) {
        if triggered.swap(true, Ordering::SeqCst) {
            return;
        }
        match self
            .relay
            .upload_with_retry(
                transfer_id,
                &file.file_name,
                &file.file_type,
                None,
                file.bytes.clone(),
            )
            .await
        {
            Ok(()) => {
                self.emit(TransferEvent::StateChanged {
                    transfer_id: transfer_id.to_string(),
                    state: TransferState::Completed,
                });
            }
            Err(err) => {
                self.session.send(ClientMessage::TransferError {
                    transfer_id: transfer_id.to_string(),
                    message: err.to_string(),
                });
                self.emit(TransferEvent::Failed {
                    transfer_id: transfer_id.to_string(),
                    message: err.to_string(),
                });
            }
        }
        tokio::time::sleep(FALLBACK_COOLDOWN).await;
    }

    async fn run_receiver(
        self: Arc<Self>,
        offer: IncomingOffer,
        mut inbound: mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        let transfer_id = offer.transfer_id.clone();
        self.emit(TransferEvent::StateChanged { transfer_id: transfer_id.clone(), state: TransferState::Connecting });

        let mut peer: Option<PeerSession> = None;
        let mut chunks: Vec<Option<Vec<u8>>> = Vec::new();
        let mut received = 0usize;
        let mut total_chunks = 0u32;
        let mut data_channel_ever_opened = false;
        let download_attempted = AtomicBool::new(false);

        loop {
            tokio::select! {
                message = inbound.recv() => {
                    match message {
                        Some(ServerMessage::WebrtcOffer { sdp, .. }) => {
                            let mut new_peer = match PeerSession::new().await {
                                Ok(p) => p,
                                Err(err) => {
                                    tracing::warn!(transfer_id = %transfer_id, %err, "failed to create peer session");
                                    continue;
                                }
                            };
                            match new_peer.create_answer(sdp).await {
                                Ok(answer_sdp) => {
                                    self.session.send(ClientMessage::WebrtcAnswer {
                                        transfer_id: transfer_id.clone(),
                                        sdp: answer_sdp,
                                    });
                                    peer = Some(new_peer);
                                }
                                Err(err) => tracing::warn!(transfer_id = %transfer_id, %err, "failed to answer offer"),
                            }
                        }
                        Some(ServerMessage::WebrtcIceCandidate { candidate, .. }) => {
                            if let Some(peer) = &peer {
                                let _ = peer.add_ice_candidate(candidate).await;
                            }
                        }
                        Some(ServerMessage::TransferComplete { .. }) if !data_channel_ever_opened => {
                            // Relay path is active: the sender gave up on the peer
                            // channel and already uploaded. Gated on having
                            // accepted, which this task's existence guarantees.
                            if !download_attempted.swap(true, Ordering::SeqCst) {
                                self.download_from_relay(&transfer_id, &offer).await;
                            }
                            return;
                        }
                        Some(ServerMessage::TransferError { message, .. }) => {
                            self.emit(TransferEvent::Failed { transfer_id: transfer_id.clone(), message });
                            self.emit(TransferEvent::StateChanged { transfer_id, state: TransferState::Failed });
                            return;
                        }
                        Some(_) => {}
                        None => return,
                    }
                }
                event = next_peer_event(&mut peer) => {
                    match event {
                        Some(PeerEvent::IceCandidate(candidate)) => {
                            self.session.send(ClientMessage::WebrtcIceCandidate {
                                transfer_id: transfer_id.clone(),
                                candidate,
                            });
                        }
                        Some(PeerEvent::DataChannelOpen) => {
                            data_channel_ever_opened = true;
                            self.emit(TransferEvent::StateChanged { transfer_id: transfer_id.clone(), state: TransferState::Connected });
                        }
                        Some(PeerEvent::DataChannelMessage(bytes)) => {
                            match serde_json::from_slice::<ChunkMessage>(&bytes) {
                                Ok(ChunkMessage::Metadata { total_chunks: n, .. }) => {
                                    total_chunks = n;
                                    chunks = vec![None; n as usize];
                                    self.emit(TransferEvent::StateChanged { transfer_id: transfer_id.clone(), state: TransferState::Transferring });
                                }
                                Ok(ChunkMessage::Chunk { index, data }) => {
                                    if (index as usize) < chunks.len() {
                                        if chunks[index as usize].is_none() {
                                            received += 1;
                                        }
                                        chunks[index as usize] = Some(data);
                                        let progress = round_progress(received as u64, total_chunks.max(1) as u64);
                                        self.emit(TransferEvent::Progress { transfer_id: transfer_id.clone(), progress });
                                        self.session.send(ClientMessage::TransferProgress {
                                            transfer_id: transfer_id.clone(),
                                            progress,
                                        });

                                        if received == total_chunks as usize {
                                            if let Err(err) = self.finish_receive(&transfer_id, &offer, &mut chunks).await {
                                                self.emit(TransferEvent::Failed { transfer_id: transfer_id.clone(), message: err.to_string() });
                                                self.session.send(ClientMessage::TransferError {
                                                    transfer_id: transfer_id.clone(),
                                                    message: err.to_string(),
                                                });
                                                self.emit(TransferEvent::StateChanged { transfer_id, state: TransferState::Failed });
                                            } else {
                                                self.session.send(ClientMessage::TransferComplete { transfer_id: transfer_id.clone() });
                                                self.emit(TransferEvent::StateChanged { transfer_id, state: TransferState::Completed });
                                            }
                                            return;
                                        }
                                    }
                                }
                                Err(err) => tracing::warn!(transfer_id = %transfer_id, %err, "malformed data channel envelope"),
                            }
                        }
                        Some(PeerEvent::ConnectionFailed) | Some(PeerEvent::DataChannelClosed) => {
                            if !data_channel_ever_opened {
                                // let the hub's eventual transfer-complete (from a
                                // sender fallback) or transfer-error drive the
                                // rest of this task; nothing to clean up here.
                            }
                        }
                        None => {}
                    }
                }
            }
        }
    }

    async fn finish_receive(
        &self,
        transfer_id: &str,
        offer: &IncomingOffer,
        chunks: &mut Vec<Option<Vec<u8>>>,
    ) -> Result<(), EngineError> {
        let mut assembled = Vec::with_capacity(offer.file_size as usize);
        for (index, slot) in chunks.iter_mut().enumerate() {
            let data = slot.take().ok_or(EngineError::MissingChunk(index as u32))?;
            assembled.extend_from_slice(&data);
        }
        self.save_handler
            .save(transfer_id, &offer.file_name, &offer.file_type, None, assembled)
            .await
    }

    async fn download_from_relay(&self, transfer_id: &str, offer: &IncomingOffer) {
        match self.relay.download(transfer_id).await {
            Ok(payload) => {
                if let Err(err) = self
                    .save_handler
                    .save(transfer_id, &offer.file_name, &offer.file_type, None, payload.to_vec())
                    .await
                {
                    self.emit(TransferEvent::Failed { transfer_id: transfer_id.to_string(), message: err.to_string() });
                    return;
                }
                self.emit(TransferEvent::StateChanged { transfer_id: transfer_id.to_string(), state: TransferState::Completed });
            }
            Err(err) => {
                self.session.send(ClientMessage::TransferError {
                    transfer_id: transfer_id.to_string(),
                    message: err.to_string(),
                });
                self.emit(TransferEvent::Failed { transfer_id: transfer_id.to_string(), message: err.to_string() });
            }
        }
        tokio::time::sleep(DOWNLOAD_COOLDOWN).await;
    }
}

/// Awaits the next event from a peer session that may not exist yet
/// (receiver side creates it only once the `webrtc-offer` arrives).
async fn next_peer_event(peer: &mut Option<PeerSession>) -> Option<PeerEvent> {
    match peer {
        Some(peer) => peer.events.recv().await,
        None => std::future::pending().await,
    }
}

fn transfer_id_of(message: &ServerMessage) -> Option<&str> {
    match message {
        ServerMessage::TransferAnswer { transfer_id, .. }
        | ServerMessage::WebrtcOffer { transfer_id, .. }
        | ServerMessage::WebrtcAnswer { transfer_id, .. }
        | ServerMessage::WebrtcIceCandidate { transfer_id, .. }
        | ServerMessage::TransferProgress { transfer_id, .. }
        | ServerMessage::TransferComplete { transfer_id }
        | ServerMessage::TransferError { transfer_id, .. } => Some(transfer_id),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_matches_spec_scenario_one() {
        let total = 48 * 1024usize;
        let chunks = total.div_ceil(CHUNK_SIZE);
        assert_eq!(chunks, 3);
    }

    #[test]
    fn progress_sequence_matches_spec_scenario_one() {
        let total_chunks = 3u64;
        let progress: Vec<u8> = (1..=3).map(|i| round_progress(i, total_chunks)).collect();
        assert_eq!(progress, vec![33, 67, 100]);
    }

    #[test]
    fn progress_rounds_half_up_and_caps_at_100() {
        assert_eq!(round_progress(0, 0), 100);
        assert_eq!(round_progress(1, 7), 14);
        assert_eq!(round_progress(7, 7), 100);
    }
}
