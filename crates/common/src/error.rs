use thiserror::Error;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("invalid rule '{key}': {message}")]
    InvalidRule { key: String, message: String },

    #[error("unknown scope '{0}'")]
    UnknownScope(String),
}

pub type WardenResult<T> = Result<T, WardenError>;
