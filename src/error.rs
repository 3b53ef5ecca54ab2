use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing executable, config file, helper, or selection.
    #[error("{0}")]
    Precondition(String),

    #[error("`{command}` failed: {detail}")]
    Command { command: String, detail: String },

    #[error("{0}")]
    Transport(String),

    /// Reason decoded from the subscription server's `Announce` header.
    #[error("{0}")]
    Rejected(String),

    #[error("Cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
