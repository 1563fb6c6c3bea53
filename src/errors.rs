use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("UNKNOWN_QUERY: {0}")]
    UnknownQuery(String),
    #[error("INVALID_PARAMS: {0}")]
    InvalidParams(String),
    #[error("POLICY_DENIED: {0}")]
    Policy(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("TRANSPORT: {0}")]
    Transport(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownQuery(_) => "UNKNOWN_QUERY",
            Self::InvalidParams(_) => "INVALID_PARAMS",
            Self::Policy(_) => "POLICY_DENIED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Transport(_) => "TRANSPORT",
            Self::Io(_) => "IO_FAILURE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::UnknownQuery(_) | Self::InvalidParams(_) => 400,
            Self::NotFound(_) => 404,
            Self::Policy(_) => 409,
            Self::Transport(_) => 502,
            Self::Io(_) | Self::Internal(_) => 500,
        }
    }

    // Errors that repeat for the same descriptor whatever the data does, so
    // live queries never retry them on their own.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::UnknownQuery(_) | Self::InvalidParams(_))
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
