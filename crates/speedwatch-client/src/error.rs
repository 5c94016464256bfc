use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("hub rejected the request ({status}): {message}")]
    Rejected {
        status: u16,
        message: String,
        code: Option<String>,
    },
    #[error("a measurement is already running on this session")]
    AlreadyActive,
    #[error("invalid hub url: {0}")]
    InvalidUrl(String),
}
