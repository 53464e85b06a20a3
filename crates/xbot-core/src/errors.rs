/// Core error type for the router.
///
/// Adapter crates map their client errors into this type. `Unauthorized` is the
/// one rejection the lifecycle layer treats as "this identity does not exist";
/// every other variant propagates to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("unauthorized credential")]
    Unauthorized,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::Unauthorized)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
