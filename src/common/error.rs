use thiserror::Error;

#[derive(Error, Debug)]
pub enum CertError {
    #[error("Truncated {field}: need {needed} bytes, have {remaining}")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("Payload accessed on a log record with a null payload")]
    NullPayload,

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Unknown message type: {0}")]
    UnknownMsgType(u8),

    #[error("Invalid string in {field}: {message}")]
    InvalidString { field: &'static str, message: String },

    #[error("Header checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Corrupted frame: {0}")]
    CorruptedFrame(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, CertError>;
