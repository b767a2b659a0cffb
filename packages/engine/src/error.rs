//! Client-side error type. Internal code returns `Result<T, EngineError>`
//! and propagates with `?`; only terminal transfer states reach the UI
//! layer, per the spec's propagation policy.

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("session is disconnected")]
    Disconnected,

    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("malformed message: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("unknown transfer {0}")]
    UnknownTransfer(String),

    #[error("peer negotiation failed: {0}")]
    Negotiation(String),

    #[error("relay upload failed after retries: {0}")]
    RelayUpload(String),

    #[error("relay download failed: {0}")]
    RelayDownload(String),

    #[error("reassembly failed: chunk {0} missing")]
    MissingChunk(u32),

    #[error("save handler failed: {0}")]
    SaveHandler(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}
