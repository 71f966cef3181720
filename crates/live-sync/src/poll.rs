//! Periodic full-state polling, the secondary source of the reconciler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SyncConfig;
use crate::error::ApiError;
use crate::protocol::{LiveSnapshot, SessionRecord, StudyRecord};
use crate::store::{IgnoreReason, LiveStore, SnapshotOutcome};

/// REST endpoints of the study backend.
#[async_trait]
pub trait StudyBackend: Send + Sync + 'static {
    async fn fetch_study(&self, study_id: &str) -> Result<StudyRecord, ApiError>;
    async fn fetch_sessions(&self, study_id: &str) -> Result<Vec<SessionRecord>, ApiError>;
    async fn fetch_live_state(&self, study_id: &str) -> Result<LiveSnapshot, ApiError>;
}

pub struct ReqwestStudyBackend {
    client: reqwest::Client,
    base_url: Url,
}

impl ReqwestStudyBackend {
    pub fn new(base_url: Url) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self { client, base_url })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, ApiError> {
        Self::new(config.api_base()?)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let endpoint = self
            .base_url
            .join(path)
            .map_err(|err| ApiError::InvalidConfig(format!("invalid endpoint {path}: {err}")))?;
        let response = self.client.get(endpoint).send().await?;
        if !response.status().is_success() {
            return Err(ApiError::HttpStatus(response.status()));
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|err| ApiError::InvalidResponse(format!("{path}: {err}")))
    }
}

/// The session list is served either bare or wrapped in `{"sessions": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum SessionList {
    Bare(Vec<SessionRecord>),
    Wrapped { sessions: Vec<SessionRecord> },
}

#[async_trait]
impl StudyBackend for ReqwestStudyBackend {
    async fn fetch_study(&self, study_id: &str) -> Result<StudyRecord, ApiError> {
        self.get_json(&format!("studies/{study_id}")).await
    }

    async fn fetch_sessions(&self, study_id: &str) -> Result<Vec<SessionRecord>, ApiError> {
        let list: SessionList = self.get_json(&format!("studies/{study_id}/sessions")).await?;
        Ok(match list {
            SessionList::Bare(sessions) | SessionList::Wrapped { sessions } => sessions,
        })
    }

    async fn fetch_live_state(&self, study_id: &str) -> Result<LiveSnapshot, ApiError> {
        self.get_json(&format!("studies/{study_id}/live-state")).await
    }
}

/// What one poll round did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub study_changed: bool,
    pub sessions: SnapshotOutcome,
    pub live_state: SnapshotOutcome,
    pub errors: usize,
    /// The store no longer belongs to this study.
    pub superseded: bool,
}

pub struct Poller {
    backend: Arc<dyn StudyBackend>,
    store: LiveStore,
    study_id: String,
    interval: Duration,
}

impl Poller {
    pub fn new(
        backend: Arc<dyn StudyBackend>,
        store: LiveStore,
        study_id: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            backend,
            store,
            study_id: study_id.into(),
            interval,
        }
    }

    /// Fetches study, session list and live state once and feeds the store.
    /// Fetch failures are logged and counted, never fatal.
    pub async fn poll_once(&self) -> PollReport {
        let mut report = PollReport::default();
        let study_id = self.study_id.as_str();

        match self.backend.fetch_study(study_id).await {
            Ok(record) => match self.store.apply_study(&record) {
                Ok(changed) => report.study_changed = changed,
                Err(reason) => self.note_ignored(&mut report, reason),
            },
            Err(err) => self.note_error(&mut report, "study", &err),
        }

        match self.backend.fetch_sessions(study_id).await {
            Ok(records) => match self.store.apply_session_list(study_id, &records) {
                Ok(outcome) => report.sessions = outcome,
                Err(reason) => self.note_ignored(&mut report, reason),
            },
            Err(err) => self.note_error(&mut report, "sessions", &err),
        }

        match self.backend.fetch_live_state(study_id).await {
            Ok(snapshot) => match self.store.apply_snapshot(study_id, &snapshot.sessions) {
                Ok(outcome) => report.live_state = outcome,
                Err(reason) => self.note_ignored(&mut report, reason),
            },
            Err(err) => self.note_error(&mut report, "live-state", &err),
        }

        report
    }

    /// Polls immediately, then every interval, until the study is terminal,
    /// the store moves to another study, or `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(target = "poll", study_id = %self.study_id, "poller cancelled");
                    return;
                }
                _ = ticker.tick() => {}
            }
            let report = self.poll_once().await;
            if report.superseded {
                debug!(target = "poll", study_id = %self.study_id, "study superseded; poller stopping");
                return;
            }
            if self.store.is_terminal() {
                info!(
                    target = "poll",
                    study_id = %self.study_id,
                    phase = self.store.phase().as_str(),
                    "study finished; poller stopping"
                );
                return;
            }
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    fn note_error(&self, report: &mut PollReport, endpoint: &'static str, err: &ApiError) {
        report.errors += 1;
        warn!(
            target = "poll",
            study_id = %self.study_id,
            endpoint,
            error = %err,
            "poll request failed"
        );
    }

    fn note_ignored(&self, report: &mut PollReport, reason: IgnoreReason) {
        if matches!(reason, IgnoreReason::NoStudy | IgnoreReason::OtherStudy) {
            report.superseded = true;
        }
    }
}
