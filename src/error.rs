use thiserror::Error;

/// Failure to pull data out of a source. Never fatal for a run: the
/// orchestrator logs it and treats the pass as "no data".
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected http status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return FetchError::Timeout(e.to_string());
        }
        if let Some(status) = e.status() {
            return FetchError::HttpStatus {
                status: status.as_u16(),
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            };
        }
        if e.is_decode() {
            return FetchError::Decode(e.to_string());
        }
        FetchError::Transport(e.to_string())
    }
}

/// A single raw record that cannot be mapped to the canonical shape.
/// Skipped and logged, never fails the batch.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("payload is not an object")]
    NotAnObject,
}

#[derive(Debug, Error)]
pub enum EtlError {
    #[error("storage error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("failure injection triggered after {processed} records (threshold {threshold})")]
    InjectedFailure { processed: usize, threshold: usize },

    #[error("unknown source: {0}")]
    UnknownSource(String),
}

pub type Result<T> = std::result::Result<T, EtlError>;
