//! `/ws` connection handler.
//!
//! Each accepted WebSocket is split into a receive loop (this task) and a
//! spawned send task fed by an unbounded channel, so a slow reader never
//! blocks other sessions' forwarding — the same shape as the teacher
//! relay's `handle_websocket`. Unlike the teacher, a device id is not
//! required before any message is accepted: `ping` works pre-registration,
//! everything else is refused with a protocol error until `device-register`
//! binds the session.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::error::HubError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::{DevicePatch, DeviceStatus};
use crate::state::HubState;
use crate::transfers::{NewTransfer, StatusUpdate, TransferStatus};

pub async fn handle_websocket(socket: WebSocket, state: HubState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => tracing::error!(%err, "failed to serialize server message"),
            }
        }
    });

    let mut bound_device: Option<String> = None;
    let mut evict_rx: Option<tokio::sync::oneshot::Receiver<()>> = None;

    loop {
        tokio::select! {
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(message) => {
                                handle_client_message(&state, &mut bound_device, &mut evict_rx, &tx, message).await;
                            }
                            Err(err) => {
                                tracing::warn!(%err, "malformed message on /ws");
                                let _ = tx.send(ServerMessage::Error {
                                    message: HubError::Protocol(err.to_string()).as_ws_message(),
                                });
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {}
                    Some(Err(err)) => {
                        tracing::warn!(%err, "websocket error");
                        break;
                    }
                }
            }
            _ = evict_rx.as_mut().unwrap(), if evict_rx.is_some() => {
                tracing::info!(device_id = bound_device.as_deref().unwrap_or(""), "session evicted by re-registration");
                break;
            }
        }
    }

    sender_task.abort();
    if let Some(device_id) = bound_device {
        state.release_session(&device_id, &tx);
        state.registry().mark_offline(&device_id);
        state.broadcast_device_list();
        tracing::info!(device_id, "session closed");
    }
}

async fn handle_client_message(
    state: &HubState,
    bound_device: &mut Option<String>,
    evict_rx: &mut Option<tokio::sync::oneshot::Receiver<()>>,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    message: ClientMessage,
) {
    match message {
        ClientMessage::Ping { timestamp } => {
            let _ = tx.send(ServerMessage::Pong { timestamp, original_timestamp: timestamp });
        }

        ClientMessage::DeviceRegister { device_id, name, device_type } => {
            state.registry().register(&device_id, name, device_type);
            let rx = state.bind_session(&device_id, tx.clone());
            *evict_rx = Some(rx);
            *bound_device = Some(device_id.clone());

            let devices = state.registry().list_reachable(Some(&device_id), state.config().liveness_secs);
            let _ = tx.send(ServerMessage::DeviceList { devices });
            state.broadcast_device_list();
        }

        other => {
            let Some(device_id) = bound_device.clone() else {
                let _ = tx.send(ServerMessage::Error {
                    message: "must send device-register before any other message".into(),
                });
                return;
            };
            if let Err(err) = route_bound_message(state, &device_id, other).await {
                tracing::warn!(device_id, %err, "message handling failed");
                let _ = tx.send(ServerMessage::Error { message: err.as_ws_message() });
            }
        }
    }
}

async fn route_bound_message(
    state: &HubState,
    sender_id: &str,
    message: ClientMessage,
) -> Result<(), HubError> {
    match message {
        ClientMessage::DeviceUpdate { name, status } => {
            let status = status.and_then(|s| match s.as_str() {
                "available" => Some(DeviceStatus::Available),
                "busy" => Some(DeviceStatus::Busy),
                "offline" => Some(DeviceStatus::Offline),
                _ => None,
            });
            state.registry().update(sender_id, DevicePatch { name, status });
            state.broadcast_device_list();
            Ok(())
        }

        ClientMessage::TransferOffer { transfer_id, file_name, file_size, file_type, receiver_id } => {
            let transfer = state.transfers().create(NewTransfer {
                id: transfer_id.clone(),
                file_name: file_name.clone(),
                file_size,
                file_type: file_type.clone(),
                sender_id: sender_id.to_string(),
                receiver_id: receiver_id.clone(),
            })?;
            state.send_to(
                &receiver_id,
                ServerMessage::TransferOffer {
                    transfer_id: transfer.id,
                    file_name,
                    file_size,
                    file_type,
                    sender_id: sender_id.to_string(),
                },
            );
            Ok(())
        }

        ClientMessage::TransferAnswer { transfer_id, accepted } => {
            let transfer = state.transfers().get(&transfer_id).ok_or_else(|| {
                HubError::UnknownTransfer(transfer_id.clone())
            })?;
            let status = if accepted { TransferStatus::Accepted } else { TransferStatus::Rejected };
            state.transfers().update(&transfer_id, StatusUpdate { status, progress: None })?;
            if accepted {
                state.relay().authorize(&transfer_id);
            }
            state.send_to(
                &transfer.sender_id,
                ServerMessage::TransferAnswer { transfer_id, accepted },
            );
            Ok(())
        }

        ClientMessage::WebrtcOffer { transfer_id, sdp } => {
            let transfer = state
                .transfers()
                .get(&transfer_id)
                .ok_or_else(|| HubError::UnknownTransfer(transfer_id.clone()))?;
            state.send_to(
                &transfer.receiver_id,
                ServerMessage::WebrtcOffer { transfer_id, sdp },
            );
            Ok(())
        }

        ClientMessage::WebrtcAnswer { transfer_id, sdp } => {
            let transfer = state
                .transfers()
                .get(&transfer_id)
                .ok_or_else(|| HubError::UnknownTransfer(transfer_id.clone()))?;
            state.send_to(
                &transfer.sender_id,
                ServerMessage::WebrtcAnswer { transfer_id, sdp },
            );
            Ok(())
        }

        ClientMessage::WebrtcIceCandidate { transfer_id, candidate } => {
            let transfer = state
                .transfers()
                .get(&transfer_id)
                .ok_or_else(|| HubError::UnknownTransfer(transfer_id.clone()))?;
            let other = if transfer.sender_id == sender_id {
                &transfer.receiver_id
            } else {
                &transfer.sender_id
            };
            state.send_to(other, ServerMessage::WebrtcIceCandidate { transfer_id, candidate });
            Ok(())
        }

        ClientMessage::TransferProgress { transfer_id, progress } => {
            let target_status = if progress >= 100 { TransferStatus::Completed } else { TransferStatus::Transferring };
            let transfer = state
                .transfers()
                .update(&transfer_id, StatusUpdate { status: target_status, progress: Some(progress) })?;
            state.send_to(&transfer.sender_id, ServerMessage::progress(&transfer));
            state.send_to(&transfer.receiver_id, ServerMessage::progress(&transfer));
            Ok(())
        }

        ClientMessage::TransferComplete { transfer_id } => {
            let transfer = state.transfers().update(
                &transfer_id,
                StatusUpdate { status: TransferStatus::Completed, progress: Some(100) },
            )?;
            if state.relay().should_notify_complete(&transfer_id) {
                state.send_to(&transfer.receiver_id, ServerMessage::TransferComplete {
                    transfer_id: transfer_id.clone(),
                });
            }
            Ok(())
        }

        ClientMessage::TransferError { transfer_id, message } => {
            let transfer = state
                .transfers()
                .update(&transfer_id, StatusUpdate { status: TransferStatus::Failed, progress: None })?;
            state.send_to(&transfer.sender_id, ServerMessage::TransferError {
                transfer_id: transfer_id.clone(),
                message: message.clone(),
            });
            state.send_to(&transfer.receiver_id, ServerMessage::TransferError { transfer_id, message });
            Ok(())
        }

        ClientMessage::DeviceRegister { .. } | ClientMessage::Ping { .. } => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;

    fn new_state() -> HubState {
        HubState::new(HubConfig::default())
    }

    async fn register(state: &HubState, device_id: &str) -> mpsc::UnboundedSender<ServerMessage> {
        let (tx, _rx) = mpsc::unbounded_channel();
        state.registry().register(device_id, device_id.into(), "laptop".into());
        state.bind_session(device_id, tx.clone());
        tx
    }

    #[tokio::test]
    async fn happy_path_offer_accept_progress_complete() {
        let state = new_state();
        let sender_tx = register(&state, "a").await;
        let receiver_tx = register(&state, "b").await;

        route_bound_message(
            &state,
            "a",
            ClientMessage::TransferOffer {
                transfer_id: "t1".into(),
                file_name: "f.bin".into(),
                file_size: 48 * 1024,
                file_type: "application/octet-stream".into(),
                receiver_id: "b".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(state.transfers().get("t1").unwrap().status, TransferStatus::Pending);

        route_bound_message(
            &state,
            "b",
            ClientMessage::TransferAnswer { transfer_id: "t1".into(), accepted: true },
        )
        .await
        .unwrap();
        assert_eq!(state.transfers().get("t1").unwrap().status, TransferStatus::Accepted);
        assert!(state.relay().is_authorized("t1"));

        for progress in [33u8, 67, 100] {
            route_bound_message(
                &state,
                "a",
                ClientMessage::TransferProgress { transfer_id: "t1".into(), progress },
            )
            .await
            .unwrap();
        }
        let transfer = state.transfers().get("t1").unwrap();
        assert_eq!(transfer.status, TransferStatus::Completed);
        assert_eq!(transfer.progress, 100);

        drop(sender_tx);
        drop(receiver_tx);
    }

    #[tokio::test]
    async fn rejection_skips_negotiation_and_authorization() {
        let state = new_state();
        register(&state, "a").await;
        register(&state, "b").await;

        route_bound_message(
            &state,
            "a",
            ClientMessage::TransferOffer {
                transfer_id: "t1".into(),
                file_name: "f.bin".into(),
                file_size: 10,
                file_type: "text/plain".into(),
                receiver_id: "b".into(),
            },
        )
        .await
        .unwrap();
        route_bound_message(
            &state,
            "b",
            ClientMessage::TransferAnswer { transfer_id: "t1".into(), accepted: false },
        )
        .await
        .unwrap();

        assert_eq!(state.transfers().get("t1").unwrap().status, TransferStatus::Rejected);
        assert!(!state.relay().is_authorized("t1"));
    }

    #[tokio::test]
    async fn offer_to_self_is_rejected() {
        let state = new_state();
        register(&state, "a").await;

        let err = route_bound_message(
            &state,
            "a",
            ClientMessage::TransferOffer {
                transfer_id: "t1".into(),
                file_name: "f.bin".into(),
                file_size: 10,
                file_type: "text/plain".into(),
                receiver_id: "a".into(),
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            HubError::Transfer(crate::transfers::TransferStoreError::SenderIsReceiver(_))
        ));
        assert!(state.transfers().get("t1").is_none());
    }

    #[tokio::test]
    async fn duplicate_registration_evicts_prior_session() {
        let state = new_state();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        state.registry().register("x", "Laptop".into(), "laptop".into());
        let evict_rx1 = state.bind_session("x", tx1);

        let (tx2, _rx2) = mpsc::unbounded_channel();
        state.registry().register("x", "Laptop".into(), "laptop".into());
        let _evict_rx2 = state.bind_session("x", tx2);

        // the first session's eviction signal should fire
        evict_rx1.await.unwrap();
        drop(rx1);

        // the device id now routes to the second session only
        assert!(state.send_to("x", ServerMessage::Error { message: "probe".into() }));
    }

    #[tokio::test]
    async fn device_update_requires_bound_session() {
        let state = new_state();
        let mut bound: Option<String> = None;
        let mut evict_rx = None;
        let (tx, mut rx) = mpsc::unbounded_channel();

        handle_client_message(
            &state,
            &mut bound,
            &mut evict_rx,
            &tx,
            ClientMessage::DeviceUpdate { name: Some("new".into()), status: None },
        )
        .await;

        match rx.recv().await {
            Some(ServerMessage::Error { .. }) => {}
            other => panic!("expected protocol error, got {other:?}"),
        }
    }
}
