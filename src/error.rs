use serde::ser::Serializer;
use serde::Serialize;
use thiserror::Error;

pub const CONNECTIVITY_MESSAGE: &str = "could not reach the bank service";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    RejectedByServer,
    Transport,
    InconsistentState,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{message}")]
    Rejected {
        message: String,
        details: Option<String>,
    },
    #[error("could not reach the bank service: {0}")]
    Transport(String),
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("malformed payload: {0}")]
    Decode(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("inconsistent state for {identity}: {detail}")]
    InconsistentState { identity: String, detail: String },
    #[error("push channel error: {0}")]
    PushChannel(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Rejected { .. } => ErrorKind::RejectedByServer,
            Self::InconsistentState { .. } => ErrorKind::InconsistentState,
            Self::Transport(_)
            | Self::Reqwest(_)
            | Self::WebSocket(_)
            | Self::SimdJson(_)
            | Self::Decode(_)
            | Self::Io(_)
            | Self::PushChannel(_) => ErrorKind::Transport,
        }
    }

    /// Text shown to the user. Transport failures collapse to one generic
    /// connectivity message; server rejections are surfaced verbatim.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(message) => message.clone(),
            Self::Rejected { message, .. } => message.clone(),
            Self::InconsistentState { .. } => self.to_string(),
            _ => CONNECTIVITY_MESSAGE.to_string(),
        }
    }
}

/// The `{ok: false, kind, message}` half of a command result.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorReport {
    pub ok: bool,
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&AppError> for ErrorReport {
    fn from(error: &AppError) -> Self {
        Self {
            ok: false,
            kind: error.kind(),
            message: error.user_message(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
