use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Transient failures of the push or frame channel. Retried locally.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to open channel: {0}")]
    Dial(String),
    #[error("failed to send on channel: {0}")]
    Send(String),
    #[error("channel closed")]
    Closed,
    #[error("gave up reconnecting after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

/// A single malformed or unrecognized push message. The message is dropped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message is missing its type tag")]
    MissingType,
    #[error("unknown message type {0}")]
    UnknownType(String),
    #[error("binary payload on the event channel")]
    UnexpectedBinary,
}

/// A single undecodable screencast frame. The frame is dropped.
#[derive(Debug, Error)]
pub enum FrameDecodeError {
    #[error("empty frame payload")]
    Empty,
    #[error("undecodable frame: {0}")]
    Image(#[from] image::ImageError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid api configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// The backend reported that the study failed. Absorbing: the study no
/// longer accepts mutations.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[error("study {study_id} failed: {message}")]
pub struct TerminalStudyError {
    pub study_id: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Frame(#[from] FrameDecodeError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Study(#[from] TerminalStudyError),
}
