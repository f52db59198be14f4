use thiserror::Error;

#[derive(Error, Debug)]
pub enum HiveError {
    #[error("No coordinator answered for service '{service}' within {timeout_ms}ms")]
    DiscoveryTimeout { service: String, timeout_ms: u64 },

    #[error("Connection failed after {0} attempts")]
    ConnectExhausted(u32),

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Invalid task file path: {0}")]
    InvalidFilePath(String),

    #[error("Task source error: {0}")]
    TaskSource(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HiveError>;
