//! Per-session screencast pipelines.
//!
//! Each enabled session gets its own channel and decode loop, independent of
//! the push channel. Frames are decoded off-screen and swapped onto the
//! session canvas. Presenting and disabling take the same per-session lock,
//! so once [`FramePipeline::disable`] returns nothing more is drawn.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::connection::{Indicator, SocketMessage, Watchdog};

pub mod canvas;
pub mod decode;
pub mod display;
pub mod source;

#[cfg(test)]
pub(crate) mod mock;

pub use canvas::{Canvas, CanvasFactory, MemoryCanvas, TraceCanvas};
pub use decode::{Frame, FrameBuffers, decode_frame};
pub use display::{DisplaySource, Placeholder, select_display};
pub use source::{FrameSource, FrameStream, WebSocketFrameSource};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameBufferState {
    pub state: PipelineState,
    pub frame_count: u64,
    pub last_frame_at: Option<SystemTime>,
    pub dropped_frames: u64,
    pub dimensions: Option<(u32, u32)>,
}

/// Pipeline state change of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameEvent {
    pub session_id: String,
    pub state: PipelineState,
}

#[derive(Clone)]
pub struct FramePipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    source: Arc<dyn FrameSource>,
    canvases: CanvasFactory,
    watchdog_ceiling: Duration,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    events: broadcast::Sender<FrameEvent>,
}

struct SessionEntry {
    shared: Arc<SessionShared>,
    active: Option<Active>,
}

struct Active {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct SessionShared {
    session_id: String,
    surface: Mutex<Surface>,
    status: Mutex<FrameBufferState>,
    watchdog: Watchdog,
    events: broadcast::Sender<FrameEvent>,
}

struct Surface {
    canvas: Box<dyn Canvas>,
    buffers: FrameBuffers,
    /// Generation allowed to draw; `0` when disabled.
    live: u64,
    next: u64,
}

impl SessionShared {
    /// Presents a frame if `generation` is still the live one.
    fn present(&self, generation: u64, frame: Frame) -> bool {
        let mut surface = self.surface.lock();
        if surface.live != generation {
            return false;
        }
        let stamp = frame.timestamp;
        let dimensions = (frame.width, frame.height);
        let Surface {
            canvas, buffers, ..
        } = &mut *surface;
        buffers.stage(frame);
        if let Some(front) = buffers.swap() {
            canvas.present(front);
        }

        let mut status = self.status.lock();
        status.frame_count += 1;
        status.last_frame_at = Some(stamp);
        status.dimensions = Some(dimensions);
        if status.state != PipelineState::Streaming {
            status.state = PipelineState::Streaming;
            self.watchdog.clear();
            self.announce(PipelineState::Streaming);
        }
        true
    }

    fn record_drop(&self) {
        self.status.lock().dropped_frames += 1;
    }

    /// The stream loop of `generation` ended on its own.
    fn finish(&self, generation: u64) {
        let mut surface = self.surface.lock();
        if surface.live != generation {
            return;
        }
        surface.live = 0;
        self.set_state(PipelineState::Stopped);
        self.watchdog.clear();
    }

    fn start(&self) -> u64 {
        let mut surface = self.surface.lock();
        surface.next += 1;
        surface.live = surface.next;
        self.set_state(PipelineState::Connecting);
        self.watchdog.arm(format!("screencast {}", self.session_id));
        surface.live
    }

    fn stop(&self) {
        let mut surface = self.surface.lock();
        surface.live = 0;
        surface.buffers.clear();
        surface.canvas.clear();
        self.set_state(PipelineState::Stopped);
        self.watchdog.clear();
    }

    fn set_state(&self, state: PipelineState) {
        let mut status = self.status.lock();
        if status.state != state {
            status.state = state;
            drop(status);
            self.announce(state);
        }
    }

    fn announce(&self, state: PipelineState) {
        let _ = self.events.send(FrameEvent {
            session_id: self.session_id.clone(),
            state,
        });
    }
}

impl FramePipeline {
    pub fn new(
        source: Arc<dyn FrameSource>,
        canvases: CanvasFactory,
        watchdog_ceiling: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(PipelineInner {
                source,
                canvases,
                watchdog_ceiling,
                sessions: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Opens the screencast channel of a session and starts drawing. Returns
    /// false when a pipeline for the session is already running.
    pub fn enable(&self, session_id: &str) -> bool {
        let mut sessions = self.inner.sessions.lock();
        let entry = sessions.entry(session_id.to_owned()).or_insert_with(|| SessionEntry {
            shared: Arc::new(SessionShared {
                session_id: session_id.to_owned(),
                surface: Mutex::new(Surface {
                    canvas: (self.inner.canvases)(session_id),
                    buffers: FrameBuffers::default(),
                    live: 0,
                    next: 0,
                }),
                status: Mutex::new(FrameBufferState::default()),
                watchdog: Watchdog::new(self.inner.watchdog_ceiling),
                events: self.inner.events.clone(),
            }),
            active: None,
        });
        if entry.active.as_ref().is_some_and(|active| !active.task.is_finished()) {
            return false;
        }

        let generation = entry.shared.start();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_stream(
            Arc::clone(&self.inner.source),
            Arc::clone(&entry.shared),
            cancel.clone(),
            generation,
        ));
        entry.active = Some(Active { cancel, task });
        debug!(target = "frames", session_id = %session_id, "screencast enabled");
        true
    }

    /// Stops drawing, clears the canvas, releases the channel and forgets the
    /// session. Returns false when nothing was running.
    pub fn disable(&self, session_id: &str) -> bool {
        let active = {
            let mut sessions = self.inner.sessions.lock();
            let Some(entry) = sessions.remove(session_id) else {
                return false;
            };
            entry.shared.stop();
            entry.active
        };
        match active {
            Some(active) => {
                active.cancel.cancel();
                debug!(target = "frames", session_id = %session_id, "screencast disabled");
                true
            }
            None => false,
        }
    }

    pub fn disable_all(&self) {
        let ids: Vec<String> = self.inner.sessions.lock().keys().cloned().collect();
        for session_id in ids {
            self.disable(&session_id);
        }
    }

    pub fn is_enabled(&self, session_id: &str) -> bool {
        self.inner
            .sessions
            .lock()
            .get(session_id)
            .is_some_and(|entry| entry.active.is_some())
    }

    pub fn enabled_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .sessions
            .lock()
            .iter()
            .filter(|(_, entry)| entry.active.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn state(&self, session_id: &str) -> Option<FrameBufferState> {
        self.inner
            .sessions
            .lock()
            .get(session_id)
            .map(|entry| entry.shared.status.lock().clone())
    }

    pub fn pipeline_state(&self, session_id: &str) -> Option<PipelineState> {
        self.state(session_id).map(|status| status.state)
    }

    pub fn indicator(&self, session_id: &str) -> Option<watch::Receiver<Indicator>> {
        self.inner
            .sessions
            .lock()
            .get(session_id)
            .map(|entry| entry.shared.watchdog.subscribe())
    }

    pub fn events(&self) -> broadcast::Receiver<FrameEvent> {
        self.inner.events.subscribe()
    }
}

async fn run_stream(
    source: Arc<dyn FrameSource>,
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
    generation: u64,
) {
    let session_id = shared.session_id.clone();
    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = source.open(&session_id) => opened,
    };
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(err) => {
            warn!(
                target = "frames",
                session_id = %session_id,
                error = %err,
                "screencast channel failed to open"
            );
            shared.finish(generation);
            return;
        }
    };
    debug!(target = "frames", session_id = %session_id, "screencast channel open");

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = stream.next() => message,
        };
        match message {
            Some(SocketMessage::Binary(bytes)) => match decode_frame(&bytes) {
                Ok(frame) => {
                    if !shared.present(generation, frame) {
                        break;
                    }
                }
                Err(err) => {
                    shared.record_drop();
                    debug!(
                        target = "frames",
                        session_id = %session_id,
                        error = %err,
                        bytes = bytes.len(),
                        "dropping undecodable frame"
                    );
                }
            },
            Some(SocketMessage::Text(_)) => {
                trace!(target = "frames", session_id = %session_id, "ignoring text on screencast channel");
            }
            None => {
                debug!(target = "frames", session_id = %session_id, "screencast channel closed");
                break;
            }
        }
    }

    stream.close().await;
    shared.finish(generation);
}
