//! Hub-wide error type.
//!
//! Every handler boundary converts into this one enum and translates it at
//! exactly one point: the WebSocket loop turns it into a wire-level
//! `{type: "error", message}` reply (session stays open); the HTTP handlers
//! turn it into a `StatusCode` via `IntoResponse`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::transfers::TransferStoreError;

#[derive(thiserror::Error, Debug)]
pub enum HubError {
    #[error("malformed message: {0}")]
    Protocol(String),

    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("unknown transfer {0}")]
    UnknownTransfer(String),

    #[error("transfer {0} not authorized for download")]
    NotAuthorized(String),

    #[error(transparent)]
    Transfer(#[from] TransferStoreError),

    #[error("upload exceeded {0} bytes")]
    PayloadTooLarge(u64),

    #[error("upload stalled: no data for 30s")]
    UploadTimedOut,

    #[error("client aborted upload")]
    UploadAborted,

    #[error("internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// The wire-level message sent back over the `/ws` session. Never
    /// closes the session.
    pub fn as_ws_message(&self) -> String {
        self.to_string()
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = match &self {
            HubError::UnknownTransfer(_) | HubError::UnknownDevice(_) => StatusCode::NOT_FOUND,
            HubError::NotAuthorized(_) => StatusCode::FORBIDDEN,
            HubError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            HubError::UploadTimedOut => StatusCode::REQUEST_TIMEOUT,
            HubError::UploadAborted => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            HubError::Protocol(_) => StatusCode::BAD_REQUEST,
            HubError::Transfer(TransferStoreError::SenderIsReceiver(_)) => StatusCode::BAD_REQUEST,
            HubError::Transfer(_) | HubError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "success": false, "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
