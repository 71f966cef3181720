use serde::Serialize;

use super::PipelineState;
use crate::store::SessionView;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Placeholder {
    /// The browser is up but nothing is visible yet.
    Loading,
    WaitingToStart,
}

/// What the session tile shows, in fallback order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", content = "url", rename_all = "snake_case")]
pub enum DisplaySource {
    LiveFrames,
    LiveView(String),
    Screenshot(String),
    Placeholder(Placeholder),
}

/// Picks the display source for a session. Re-evaluate whenever the session
/// or its pipeline state changes.
pub fn select_display(session: &SessionView, pipeline: Option<PipelineState>) -> DisplaySource {
    if pipeline == Some(PipelineState::Streaming) {
        return DisplaySource::LiveFrames;
    }
    if session.browser_active {
        if let Some(url) = &session.live_view_url {
            return DisplaySource::LiveView(url.clone());
        }
    }
    if let Some(url) = &session.screenshot_url {
        return DisplaySource::Screenshot(url.clone());
    }
    if session.browser_active {
        DisplaySource::Placeholder(Placeholder::Loading)
    } else {
        DisplaySource::Placeholder(Placeholder::WaitingToStart)
    }
}
