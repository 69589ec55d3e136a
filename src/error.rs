use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    /// Context, cluster or user could not be resolved from the kubeconfig.
    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Local socket error: {0}")]
    LocalSocket(#[source] std::io::Error),

    #[error("No response from remote within {0:?}")]
    ResponseTimeout(Duration),

    #[error("Session stopped")]
    Cancelled,
}

impl TunnelError {
    /// Whether another connection attempt can fix this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TunnelError::Transport(_) | TunnelError::WebSocket(_))
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;
