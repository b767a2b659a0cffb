//! Native WebRTC peer session.
//!
//! The spec's "peer session" is implemented over the `webrtc` crate — a
//! native, non-browser stack — rather than a browser `RTCPeerConnection`,
//! since this workspace is a native client. Externally-visible semantics
//! match the spec exactly: STUN-only rendezvous, one ordered reliable data
//! channel named `fileTransfer` with a 3000 ms per-packet lifetime.

use std::sync::Arc;

use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::EngineError;

/// Default public STUN rendezvous servers. Rendezvous servers only help
/// discover reachable addresses; they never see payload bytes.
pub const DEFAULT_STUN_SERVERS: &[&str] = &["stun:stun.l.google.com:19302"];

pub const DATA_CHANNEL_NAME: &str = "fileTransfer";
pub const DATA_CHANNEL_MAX_PACKET_LIFETIME_MS: u16 = 3000;

/// Events surfaced from the peer connection to the Transfer Engine's state
/// machine, so `transfer.rs` never touches `webrtc` types directly.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    IceCandidate(serde_json::Value),
    DataChannelOpen,
    DataChannelClosed,
    DataChannelMessage(Vec<u8>),
    ConnectionFailed,
}

pub struct PeerSession {
    pc: Arc<RTCPeerConnection>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
    data_channel: Option<Arc<RTCDataChannel>>,
}

impl PeerSession {
    /// Builds a peer connection configured with the default STUN set.
    pub async fn new() -> Result<Self, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| EngineError::Negotiation(e.to_string()))?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let ice_tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let ice_tx = ice_tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    if let Ok(init) = candidate.to_json() {
                        if let Ok(value) = serde_json::to_value(&init) {
                            let _ = ice_tx.send(PeerEvent::IceCandidate(value));
                        }
                    }
                }
            })
        }));

        let failed_tx = events_tx.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let failed_tx = failed_tx.clone();
            Box::pin(async move {
                if matches!(
                    state,
                    RTCIceConnectionState::Failed | RTCIceConnectionState::Disconnected
                ) {
                    let _ = failed_tx.send(PeerEvent::ConnectionFailed);
                }
            })
        }));

        let pc_failed_tx = events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let pc_failed_tx = pc_failed_tx.clone();
            Box::pin(async move {
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected
                ) {
                    let _ = pc_failed_tx.send(PeerEvent::ConnectionFailed);
                }
            })
        }));

        Ok(Self { pc, events_tx, events: events_rx, data_channel: None })
    }

    /// Sender path: create the `fileTransfer` data channel, an offer, and
    /// set it as the local description.
    pub async fn create_offer(&mut self) -> Result<serde_json::Value, EngineError> {
        let dc_init = RTCDataChannelInit {
            ordered: Some(true),
            max_packet_life_time: Some(DATA_CHANNEL_MAX_PACKET_LIFETIME_MS),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(DATA_CHANNEL_NAME, Some(dc_init))
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;
        Self::wire_data_channel(&dc, self.events_tx.clone());
        self.data_channel = Some(dc);

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;
        serde_json::to_value(&offer).map_err(EngineError::from)
    }

    /// Receiver path: attach a data-channel handler, accept the remote
    /// offer, and produce a local answer.
    pub async fn create_answer(
        &mut self,
        remote_offer: serde_json::Value,
    ) -> Result<serde_json::Value, EngineError> {
        let ondc_tx = self.events_tx.clone();
        self.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let ondc_tx = ondc_tx.clone();
            Self::wire_data_channel(&dc, ondc_tx);
            Box::pin(async {})
        }));

        let offer: RTCSessionDescription =
            serde_json::from_value(remote_offer).map_err(EngineError::from)?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;
        serde_json::to_value(&answer).map_err(EngineError::from)
    }

    pub async fn set_remote_answer(&self, remote_answer: serde_json::Value) -> Result<(), EngineError> {
        let answer: RTCSessionDescription =
            serde_json::from_value(remote_answer).map_err(EngineError::from)?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))
    }

    pub async fn add_ice_candidate(&self, candidate: serde_json::Value) -> Result<(), EngineError> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate).map_err(EngineError::from)?;
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))
    }

    /// Sends one data-channel message. Used for both the metadata object
    /// and each chunk envelope.
    pub async fn send(&self, payload: &[u8]) -> Result<(), EngineError> {
        let dc = self.data_channel.as_ref().ok_or_else(|| {
            EngineError::Negotiation("data channel not open".to_string())
        })?;
        dc.send(&bytes::Bytes::copy_from_slice(payload))
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;
        Ok(())
    }

    fn wire_data_channel(dc: &Arc<RTCDataChannel>, events_tx: mpsc::UnboundedSender<PeerEvent>) {
        let open_tx = events_tx.clone();
        dc.on_open(Box::new(move || {
            let _ = open_tx.send(PeerEvent::DataChannelOpen);
            Box::pin(async {})
        }));

        let close_tx = events_tx.clone();
        dc.on_close(Box::new(move || {
            let _ = close_tx.send(PeerEvent::DataChannelClosed);
            Box::pin(async {})
        }));

        let msg_tx = events_tx.clone();
        dc.on_message(Box::new(move |msg| {
            let msg_tx = msg_tx.clone();
            let data = msg.data.to_vec();
            Box::pin(async move {
                let _ = msg_tx.send(PeerEvent::DataChannelMessage(data));
            })
        }));
    }

    pub async fn close(&self) -> Result<(), EngineError> {
        self.pc
            .close()
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))
    }
}
