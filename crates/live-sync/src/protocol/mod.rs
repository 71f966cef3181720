//! Wire vocabulary of the push channel.
//!
//! Inbound messages are JSON objects tagged by `type`. The vocabulary is fixed;
//! anything outside it is a [`ProtocolError`] and is dropped by the caller.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

pub mod action;
pub mod records;

pub use action::{Action, ActionKind};
pub use records::{
    LiveSnapshot, SessionPatch, SessionRecord, SessionStatus, StudyRecord, StudyStatus,
};

use action::deserialize_lenient;
use records::deserialize_timestamp;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PushEvent {
    #[serde(rename = "study:progress")]
    StudyProgress(ProgressUpdate),
    #[serde(rename = "session:step")]
    SessionStep(StepUpdate),
    #[serde(rename = "session:complete")]
    SessionComplete(SessionCompletion),
    #[serde(rename = "session:live_view")]
    SessionLiveView(LiveViewUpdate),
    #[serde(rename = "session:browser_closed")]
    BrowserClosed(SessionRef),
    #[serde(rename = "study:session_snapshot")]
    SessionSnapshot(SnapshotUpdate),
    #[serde(rename = "study:analyzing")]
    StudyAnalyzing(StudyRef),
    #[serde(rename = "study:complete")]
    StudyComplete(StudyCompletion),
    #[serde(rename = "study:error")]
    StudyError(StudyFailure),
}

impl PushEvent {
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "study:progress",
        "session:step",
        "session:complete",
        "session:live_view",
        "session:browser_closed",
        "study:session_snapshot",
        "study:analyzing",
        "study:complete",
        "study:error",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            PushEvent::StudyProgress(_) => "study:progress",
            PushEvent::SessionStep(_) => "session:step",
            PushEvent::SessionComplete(_) => "session:complete",
            PushEvent::SessionLiveView(_) => "session:live_view",
            PushEvent::BrowserClosed(_) => "session:browser_closed",
            PushEvent::SessionSnapshot(_) => "study:session_snapshot",
            PushEvent::StudyAnalyzing(_) => "study:analyzing",
            PushEvent::StudyComplete(_) => "study:complete",
            PushEvent::StudyError(_) => "study:error",
        }
    }

    pub fn study_id(&self) -> &str {
        match self {
            PushEvent::StudyProgress(update) => &update.study_id,
            PushEvent::SessionStep(step) => &step.study_id,
            PushEvent::SessionComplete(done) => &done.study_id,
            PushEvent::SessionLiveView(view) => &view.study_id,
            PushEvent::BrowserClosed(session) => &session.study_id,
            PushEvent::SessionSnapshot(snapshot) => &snapshot.study_id,
            PushEvent::StudyAnalyzing(study) => &study.study_id,
            PushEvent::StudyComplete(done) => &done.study_id,
            PushEvent::StudyError(failure) => &failure.study_id,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            PushEvent::StudyProgress(update) => Some(&update.session_id),
            PushEvent::SessionStep(step) => Some(&step.session_id),
            PushEvent::SessionComplete(done) => Some(&done.session_id),
            PushEvent::SessionLiveView(view) => Some(&view.session_id),
            PushEvent::BrowserClosed(session) => Some(&session.session_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub study_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotional_state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepUpdate {
    pub study_id: String,
    pub session_id: String,
    pub step_number: u32,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_timestamp"
    )]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub think_aloud: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotional_state: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_lenient"
    )]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCompletion {
    pub study_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
    #[serde(default = "default_success")]
    pub success: bool,
}

fn default_success() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveViewUpdate {
    pub study_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_view_url: Option<String>,
    #[serde(default, alias = "screencast_available")]
    pub screencast: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRef {
    pub study_id: String,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotUpdate {
    pub study_id: String,
    #[serde(default)]
    pub sessions: HashMap<String, SessionPatch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyRef {
    pub study_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyCompletion {
    pub study_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyFailure {
    pub study_id: String,
    #[serde(alias = "message")]
    pub error: String,
}

/// Control messages sent by the client on the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { study_id: String },
    Unsubscribe { study_id: String },
    Ping,
}

impl ClientMessage {
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One decoded inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(PushEvent),
    /// Keep-alive reply or subscription acknowledgement; carries no state.
    Control(String),
}

const CONTROL_TYPES: &[&str] = &["pong", "subscribed", "unsubscribed", "connected"];

pub fn parse_inbound(text: &str) -> Result<Inbound, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_owned();

    if CONTROL_TYPES.contains(&kind.as_str()) {
        return Ok(Inbound::Control(kind));
    }
    if !PushEvent::KNOWN_TYPES.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }
    let event = serde_json::from_value::<PushEvent>(value)?;
    Ok(Inbound::Event(event))
}
