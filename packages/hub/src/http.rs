//! Relay HTTP endpoints: fallback upload/download plus read-only inventory
//! and device listing. The JSON responses use the same small
//! `ApiResponse<T>` envelope the rest of this codebase's HTTP surface uses;
//! the download endpoint streams a bare body since it is a file, not JSON.

use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde::Serialize;

use crate::error::HubError;
use crate::registry::Device;
use crate::state::HubState;
use crate::transfers::{StatusUpdate, Transfer, TransferStatus};

#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self { ok: true, data: Some(data), error: None })
    }
}

/// `GET /healthz` — operational liveness probe, not part of the transfer
/// protocol.
pub async fn healthz(State(state): State<HubState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.session_count(),
    }))
}

/// `GET /api/devices` — reachable devices only.
pub async fn list_devices(State(state): State<HubState>) -> Json<Vec<Device>> {
    Json(state.registry().list_reachable(None, state.config().liveness_secs))
}

#[derive(Serialize)]
pub struct Inventory {
    pub active: Vec<Transfer>,
    pub history: Vec<Transfer>,
}

/// `GET /api/transfers/{deviceId}`.
pub async fn transfers_for_device(
    State(state): State<HubState>,
    Path(device_id): Path<String>,
) -> Json<Inventory> {
    Json(Inventory {
        active: state.transfers().active_for(&device_id),
        history: state.transfers().history_for(&device_id, state.config().history_limit),
    })
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| urlencoding::decode(s).map(|c| c.into_owned()).unwrap_or_else(|_| s.to_string()))
}

/// `POST /api/transfer/{transferId}/upload`.
///
/// Streams the body to memory with a 30s-inactivity timeout and a
/// configurable byte cap, rather than buffering via `axum::body::Bytes`
/// directly — that would give up the ability to detect a stalled upload or
/// reject an oversized one before the whole body has already arrived.
pub async fn upload(
    State(state): State<HubState>,
    Path(transfer_id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    match upload_inner(&state, &transfer_id, &headers, body).await {
        Ok(resp) => resp,
        Err(err) => err.into_response(),
    }
}

async fn upload_inner(
    state: &HubState,
    transfer_id: &str,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, HubError> {
    // Idempotent re-send: a prior attempt already landed a full payload.
    if state.relay().has_payload(transfer_id) {
        tracing::info!(transfer_id, "upload already processed, replying idempotently");
        return Ok(ApiResponse::ok(serde_json::json!({ "success": true })).into_response());
    }

    let file_name = header_value(headers, "x-filename").unwrap_or_else(|| "file".to_string());
    let media_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let relative_path = header_value(headers, "x-relative-path");
    let sender_id = header_value(headers, "x-sender-id");
    let receiver_id = header_value(headers, "x-receiver-id");

    let cap = state.config().max_relay_bytes;
    let idle_timeout = Duration::from_secs(state.config().upload_idle_timeout_secs);

    let mut stream = body.into_data_stream();
    let mut buffer = BytesMut::new();

    loop {
        let next = tokio::time::timeout(idle_timeout, stream.next()).await;
        let chunk = match next {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(_))) => return Err(HubError::UploadAborted),
            Ok(None) => break,
            Err(_) => return Err(HubError::UploadTimedOut),
        };
        if buffer.len() as u64 + chunk.len() as u64 > cap {
            return Err(HubError::PayloadTooLarge(cap));
        }
        buffer.extend_from_slice(&chunk);
    }

    let payload: Bytes = buffer.freeze();

    state.relay().store(
        transfer_id,
        payload,
        file_name,
        media_type,
        relative_path,
    );

    // Folder transfers may bypass signaling entirely (sender/receiver
    // headers present, no prior transfer-offer). Per the resolved open
    // question, those still require the relay authorization flag — set
    // only by a `transfer-answer(accepted=true)` — before download works,
    // and before the receiver is told the transfer is complete.
    if let Some(transfer) = state.transfers().get(transfer_id) {
        if state.relay().is_authorized(transfer_id) {
            let receiver_id = transfer.receiver_id.clone();
            state.transfers().update(
                transfer_id,
                StatusUpdate { status: TransferStatus::Completed, progress: Some(100) },
            )?;
            if state.relay().should_notify_complete(transfer_id) {
                state.send_to(
                    &receiver_id,
                    crate::protocol::ServerMessage::TransferComplete { transfer_id: transfer_id.to_string() },
                );
            }
        } else {
            tracing::info!(transfer_id, "payload stored for unaccepted transfer, withholding completion");
        }
    } else if let (Some(sender_id), Some(receiver_id)) = (sender_id, receiver_id) {
        tracing::info!(transfer_id, sender_id, receiver_id, "relay upload with no prior transfer-offer");
    }

    Ok(ApiResponse::ok(serde_json::json!({ "success": true })).into_response())
}

/// `GET /api/transfer/{transferId}/download`.
pub async fn download(
    State(state): State<HubState>,
    Path(transfer_id): Path<String>,
) -> Response {
    if !state.relay().is_authorized(&transfer_id) {
        return HubError::NotAuthorized(transfer_id).into_response();
    }
    let Some(entry) = state.relay().get(&transfer_id) else {
        return HubError::UnknownTransfer(transfer_id).into_response();
    };
    if entry.payload.is_empty() {
        return HubError::UnknownTransfer(transfer_id).into_response();
    }

    let fallback_type = header::HeaderValue::from_static("application/octet-stream");
    let fallback_disposition = header::HeaderValue::from_static("attachment");

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        entry.media_type.parse().unwrap_or(fallback_type),
    );
    let sanitized_name: String = entry.file_name.chars().filter(|c| !c.is_control() && *c != '"').collect();
    headers.insert(
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{sanitized_name}\"")
            .parse()
            .unwrap_or(fallback_disposition),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        header::HeaderValue::from(entry.payload.len() as u64),
    );

    let transfer_id_owned = transfer_id.clone();
    let hub_state = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(crate::relay::DOWNLOADED_RETENTION).await;
        hub_state.relay().discard(&transfer_id_owned);
    });

    (StatusCode::OK, headers, Body::from(entry.payload)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::protocol::ServerMessage;
    use crate::transfers::NewTransfer;

    #[tokio::test]
    async fn download_without_authorization_is_forbidden() {
        let state = HubState::new(HubConfig::default());
        let response = download(State(state), Path("missing".to_string())).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn upload_for_unaccepted_transfer_stores_payload_but_withholds_completion() {
        let state = HubState::new(HubConfig::default());
        state.transfers().create(NewTransfer {
            id: "t1".into(),
            file_name: "a.bin".into(),
            file_size: 3,
            file_type: "application/octet-stream".into(),
            sender_id: "a".into(),
            receiver_id: "b".into(),
        }).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        state.bind_session("b", tx);

        let headers = HeaderMap::new();
        let response = upload_inner(&state, "t1", &headers, Body::from(&b"hey"[..])).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // payload landed, but the transfer was never accepted
        assert!(state.relay().has_payload("t1"));
        assert_eq!(state.transfers().get("t1").unwrap().status, TransferStatus::Pending);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn upload_for_accepted_transfer_notifies_completion() {
        let state = HubState::new(HubConfig::default());
        state.transfers().create(NewTransfer {
            id: "t1".into(),
            file_name: "a.bin".into(),
            file_size: 3,
            file_type: "application/octet-stream".into(),
            sender_id: "a".into(),
            receiver_id: "b".into(),
        }).unwrap();
        state.relay().authorize("t1");

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        state.bind_session("b", tx);

        let headers = HeaderMap::new();
        let response = upload_inner(&state, "t1", &headers, Body::from(&b"hey"[..])).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(state.transfers().get("t1").unwrap().status, TransferStatus::Completed);
        match rx.try_recv() {
            Ok(ServerMessage::TransferComplete { transfer_id }) => assert_eq!(transfer_id, "t1"),
            other => panic!("expected transfer-complete, got {other:?}"),
        }
    }
}
