use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{0}")]
    Detection(String),
    #[error("failed to fingerprint query: {query}")]
    MalformedQuery { query: String, reason: String },
    #[error("failed to capture call stack: {0}")]
    StackCapture(String),
}

impl Error {
    pub fn report(&self) -> Option<&str> {
        match self {
            Error::Detection(report) => Some(report),
            _ => None,
        }
    }

    pub fn is_detection(&self) -> bool {
        matches!(self, Error::Detection(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
