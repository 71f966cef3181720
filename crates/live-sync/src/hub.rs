//! Refcounted per-study observation on top of the shared push connection.
//!
//! A [`StudyHub`] keeps one [`LiveStore`] per watched study. The first
//! [`StudyWatch`] for a study subscribes on the push channel and starts the
//! poller; the last one to drop tears both down again. A single router task
//! hands every push event to the store of the study it belongs to.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SyncConfig;
use crate::connection::{
    ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionOptions, ConnectionState,
    Indicator, PushTransport, WebSocketTransport,
};
use crate::error::SyncError;
use crate::frames::{CanvasFactory, FramePipeline, WebSocketFrameSource};
use crate::poll::{Poller, ReqwestStudyBackend, StudyBackend};
use crate::store::{ListenerGuard, LiveStore, StoreChange, StudyView};

#[derive(Debug, Clone)]
pub struct HubOptions {
    pub connection: ConnectionOptions,
    pub poll_interval: Duration,
    pub max_steps: u32,
}

impl HubOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            connection: ConnectionOptions::from_config(config),
            poll_interval: config.poll_interval,
            max_steps: config.max_steps,
        }
    }
}

impl Default for HubOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[derive(Clone)]
pub struct StudyHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    connection: ConnectionManager,
    backend: Arc<dyn StudyBackend>,
    frames: Option<FramePipeline>,
    options: HubOptions,
    studies: Mutex<HashMap<String, StudyEntry>>,
}

struct StudyEntry {
    store: LiveStore,
    watchers: usize,
    connection: ConnectionHandle,
    cancel: CancellationToken,
    _frames: Option<ListenerGuard>,
}

impl StudyHub {
    /// Must be called inside a tokio runtime: it spawns the connection driver
    /// and the push router.
    pub fn new(
        transport: Arc<dyn PushTransport>,
        backend: Arc<dyn StudyBackend>,
        frames: Option<FramePipeline>,
        options: HubOptions,
    ) -> Self {
        let connection = ConnectionManager::new(transport, options.connection.clone());
        let events = connection.events();
        let inner = Arc::new(HubInner {
            connection,
            backend,
            frames,
            options,
            studies: Mutex::new(HashMap::new()),
        });
        tokio::spawn(route(Arc::downgrade(&inner), events));
        Self { inner }
    }

    /// Wires the websocket transport, the REST backend and, when a canvas
    /// factory is given, a screencast pipeline from configuration.
    pub fn from_config(
        config: &SyncConfig,
        canvases: Option<CanvasFactory>,
    ) -> Result<Self, SyncError> {
        let transport = Arc::new(WebSocketTransport::new(config.push_endpoint()?));
        let backend = Arc::new(ReqwestStudyBackend::from_config(config)?);
        let frames = canvases.map(|canvases| {
            FramePipeline::new(
                Arc::new(WebSocketFrameSource::new(config.frames_url.clone())),
                canvases,
                config.watchdog_ceiling,
            )
        });
        Ok(Self::new(
            transport,
            backend,
            frames,
            HubOptions::from_config(config),
        ))
    }

    /// Starts (or joins) observation of a study.
    pub fn attach(&self, study_id: impl Into<String>) -> StudyWatch {
        let study_id = study_id.into();
        let mut studies = self.inner.studies.lock();
        let entry = studies
            .entry(study_id.clone())
            .or_insert_with(|| self.inner.start(&study_id));
        entry.watchers += 1;
        debug!(target = "hub", study_id = %study_id, watchers = entry.watchers, "study attached");
        StudyWatch {
            store: entry.store.clone(),
            study_id,
            hub: Arc::clone(&self.inner),
        }
    }

    pub fn watched_studies(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.studies.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.watch_state()
    }

    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.connection.events()
    }

    /// Busy indicator of the push connection.
    pub fn connection_indicator(&self) -> watch::Receiver<Indicator> {
        self.inner.connection.indicator()
    }

    pub fn frames(&self) -> Option<&FramePipeline> {
        self.inner.frames.as_ref()
    }
}

impl HubInner {
    fn start(&self, study_id: &str) -> StudyEntry {
        let store = LiveStore::new(self.options.max_steps);
        store.init_study(study_id);
        let frames = self
            .frames
            .as_ref()
            .map(|pipeline| drive_frames(&store, pipeline.clone()));

        let connection = self.connection.connect();
        connection.subscribe(study_id);

        let cancel = CancellationToken::new();
        Poller::new(
            Arc::clone(&self.backend),
            store.clone(),
            study_id,
            self.options.poll_interval,
        )
        .spawn(cancel.clone());

        info!(target = "hub", study_id = %study_id, "watching study");
        StudyEntry {
            store,
            watchers: 0,
            connection,
            cancel,
            _frames: frames,
        }
    }

    fn detach(&self, study_id: &str) {
        // teardown stays under the lock so a concurrent attach of the same
        // study only subscribes after this unsubscribe has been queued
        let mut studies = self.studies.lock();
        let Some(entry) = studies.get_mut(study_id) else {
            return;
        };
        entry.watchers = entry.watchers.saturating_sub(1);
        if entry.watchers > 0 {
            return;
        }
        let Some(entry) = studies.remove(study_id) else {
            return;
        };

        entry.cancel.cancel();
        entry.connection.unsubscribe(study_id);
        if let Some(pipeline) = &self.frames {
            for session in entry.store.view().sessions {
                pipeline.disable(&session.session_id);
            }
        }
        drop(studies);
        drop(entry);
        info!(target = "hub", study_id = %study_id, "stopped watching study");
    }
}

/// Keeps screencast pipelines in step with the sessions of one store.
fn drive_frames(store: &LiveStore, pipeline: FramePipeline) -> ListenerGuard {
    let reader = store.clone();
    store.subscribe(move |change| match change {
        StoreChange::SessionUpdated { session_id } => {
            let wanted = reader
                .session(session_id)
                .is_some_and(|session| session.wants_screencast());
            if wanted {
                pipeline.enable(session_id);
            } else if pipeline.is_enabled(session_id) {
                pipeline.disable(session_id);
            }
        }
        StoreChange::StudyUpdated { phase, .. } if phase.is_terminal() => {
            for session in reader.view().sessions {
                if pipeline.is_enabled(&session.session_id) {
                    pipeline.disable(&session.session_id);
                }
            }
        }
        _ => {}
    })
}

async fn route(hub: Weak<HubInner>, mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Push(event)) => {
                let Some(hub) = hub.upgrade() else {
                    return;
                };
                let store = hub
                    .studies
                    .lock()
                    .get(event.study_id())
                    .map(|entry| entry.store.clone());
                match store {
                    Some(store) => {
                        store.handle_event(event);
                    }
                    None => trace!(
                        target = "hub",
                        study_id = %event.study_id(),
                        event = event.kind(),
                        "push event for unwatched study"
                    ),
                }
            }
            Ok(ConnectionEvent::State(state)) => {
                debug!(target = "hub", state = state.as_str(), "connection state");
            }
            Ok(ConnectionEvent::Exhausted { attempts }) => {
                warn!(
                    target = "hub",
                    attempts, "push connection gave up; relying on polling"
                );
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(target = "hub", skipped, "router lagged behind push events");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

/// Observation of one study. Dropping the last watch of a study stops its
/// subscription, poller and screencasts.
pub struct StudyWatch {
    study_id: String,
    store: LiveStore,
    hub: Arc<HubInner>,
}

impl StudyWatch {
    pub fn study_id(&self) -> &str {
        &self.study_id
    }

    pub fn store(&self) -> &LiveStore {
        &self.store
    }

    pub fn view(&self) -> StudyView {
        self.store.view()
    }

    /// Streams store changes until the returned stream is dropped.
    pub fn changes(&self) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let guard = self.store.subscribe(move |change| {
            let _ = tx.send(change.clone());
        });
        ChangeStream { rx, _guard: guard }
    }
}

impl Drop for StudyWatch {
    fn drop(&mut self) {
        self.hub.detach(&self.study_id);
    }
}

pub struct ChangeStream {
    rx: mpsc::UnboundedReceiver<StoreChange>,
    _guard: ListenerGuard,
}

impl ChangeStream {
    pub async fn next(&mut self) -> Option<StoreChange> {
        self.rx.recv().await
    }

    /// Drains whatever is already queued.
    pub fn try_next(&mut self) -> Option<StoreChange> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::MockTransport;
    use crate::frames::mock::MockFrameSource;
    use crate::frames::{Canvas, MemoryCanvas};
    use crate::poll::tests::MockBackend;
    use crate::progress::StudyPhase;
    use crate::protocol::{ClientMessage, StudyStatus};

    struct Fixture {
        transport: MockTransport,
        backend: MockBackend,
        source: MockFrameSource,
        hub: StudyHub,
    }

    fn fixture() -> Fixture {
        let transport = MockTransport::new();
        let backend = MockBackend::new("st-1");
        let source = MockFrameSource::new();
        let canvas = MemoryCanvas::new();
        let frames = FramePipeline::new(
            Arc::new(source.clone()),
            Arc::new(move |_: &str| Box::new(canvas.clone()) as Box<dyn Canvas>),
            Duration::from_secs(15),
        );
        let hub = StudyHub::new(
            Arc::new(transport.clone()),
            Arc::new(backend.clone()),
            Some(frames),
            HubOptions {
                connection: ConnectionOptions::default(),
                poll_interval: Duration::from_secs(3),
                max_steps: 30,
            },
        );
        Fixture {
            transport,
            backend,
            source,
            hub,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn watches_share_one_subscription_and_release_it_together() {
        let fx = fixture();
        let first = fx.hub.attach("st-1");
        let second = fx.hub.attach("st-1");
        eventually(|| fx.transport.subscribes() == vec!["st-1".to_string()]).await;
        assert_eq!(fx.hub.watched_studies(), vec!["st-1".to_string()]);
        assert_eq!(fx.hub.connection_state(), ConnectionState::Open);

        drop(first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fx.transport.is_connected());
        assert!(!fx.transport.sent().contains(&ClientMessage::Unsubscribe {
            study_id: "st-1".into()
        }));

        drop(second);
        eventually(|| !fx.transport.is_connected()).await;
        assert!(fx.hub.watched_studies().is_empty());
        assert_eq!(fx.hub.connection_state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn detach_then_reattach_keeps_the_subscription() {
        let fx = fixture();
        let first = fx.hub.attach("st-1");
        eventually(|| fx.transport.subscribes().len() == 1).await;

        drop(first);
        let second = fx.hub.attach("st-1");
        let last_subscription = || {
            fx.transport.sent().into_iter().rev().find(|message| {
                matches!(
                    message,
                    ClientMessage::Subscribe { .. } | ClientMessage::Unsubscribe { .. }
                )
            })
        };
        eventually(|| fx.transport.is_connected() && fx.transport.subscribes().len() >= 2).await;
        assert_eq!(
            last_subscription(),
            Some(ClientMessage::Subscribe {
                study_id: "st-1".into()
            })
        );

        fx.transport.push_text(
            r#"{"type":"session:step","study_id":"st-1","session_id":"a","step_number":2}"#,
        );
        eventually(|| second.store().session("a").is_some()).await;
        assert_eq!(fx.hub.watched_studies(), vec!["st-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn push_events_reach_the_store_of_their_study() {
        let fx = fixture();
        let watch = fx.hub.attach("st-1");
        let mut changes = watch.changes();
        eventually(|| fx.transport.is_connected()).await;

        fx.transport.push_text(
            r#"{"type":"session:step","study_id":"st-1","session_id":"a","step_number":1,
                "think_aloud":"where is pricing?","emotional_state":"curious"}"#,
        );
        fx.transport.push_text(
            r#"{"type":"session:step","study_id":"other","session_id":"z","step_number":1}"#,
        );
        eventually(|| watch.store().session("a").is_some()).await;
        assert!(watch.store().session("z").is_none());
        assert_eq!(
            watch.store().timeline("a").map(|steps| steps.len()),
            Some(1)
        );

        let mut appended = false;
        while let Some(change) = changes.try_next() {
            appended |= matches!(change, StoreChange::StepAppended { step_number: 1, .. });
        }
        assert!(appended);
    }

    #[tokio::test(start_paused = true)]
    async fn screencast_follows_session_flags_and_detach() {
        let fx = fixture();
        let frames = fx.hub.frames().cloned().unwrap();
        let watch = fx.hub.attach("st-1");
        eventually(|| fx.transport.is_connected()).await;

        fx.transport.push_text(
            r#"{"type":"session:live_view","study_id":"st-1","session_id":"a",
                "live_view_url":"https://live.test/a","screencast":true}"#,
        );
        eventually(|| fx.source.is_open("a")).await;
        assert!(frames.is_enabled("a"));

        fx.transport
            .push_text(r#"{"type":"session:browser_closed","study_id":"st-1","session_id":"a"}"#);
        eventually(|| !frames.is_enabled("a")).await;
        eventually(|| fx.source.closed() == vec!["a".to_string()]).await;

        fx.transport.push_text(
            r#"{"type":"session:live_view","study_id":"st-1","session_id":"b","screencast":true}"#,
        );
        eventually(|| fx.source.is_open("b")).await;
        drop(watch);
        eventually(|| !frames.is_enabled("b")).await;
    }

    #[tokio::test(start_paused = true)]
    async fn pushed_completion_finishes_the_study_and_its_screencasts() {
        let fx = fixture();
        let frames = fx.hub.frames().cloned().unwrap();
        let watch = fx.hub.attach("st-1");
        let mut changes = watch.changes();
        eventually(|| fx.transport.is_connected()).await;

        fx.transport.push_text(
            r#"{"type":"session:live_view","study_id":"st-1","session_id":"a","screencast":true}"#,
        );
        eventually(|| fx.source.is_open("a")).await;

        fx.transport
            .push_text(r#"{"type":"study:complete","study_id":"st-1","score":77.0}"#);
        eventually(|| watch.store().phase() == StudyPhase::Complete).await;
        assert_eq!(watch.view().score, Some(77.0));
        eventually(|| !frames.is_enabled("a")).await;

        let mut finished = false;
        while let Some(change) = changes.try_next() {
            finished |= matches!(
                change,
                StoreChange::StudyUpdated {
                    phase: StudyPhase::Complete,
                    percent: 100
                }
            );
        }
        assert!(finished);

        // the backend still reports running; polling never rewinds the phase
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(watch.store().phase(), StudyPhase::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn poller_finishes_the_study_without_push() {
        let fx = fixture();
        fx.transport.fail_next(100);
        let watch = fx.hub.attach("st-1");
        eventually(|| watch.store().phase() == StudyPhase::Running).await;

        fx.backend.set_status(StudyStatus::Complete);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(watch.store().phase(), StudyPhase::Complete);
        assert_eq!(watch.view().percent, 100);
    }
}
