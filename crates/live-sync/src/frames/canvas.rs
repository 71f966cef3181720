use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::decode::Frame;

/// Visible drawing surface of one session.
pub trait Canvas: Send + 'static {
    fn present(&mut self, frame: &Frame);
    fn clear(&mut self);
}

/// Builds the canvas for a session when its pipeline is enabled.
pub type CanvasFactory = Arc<dyn Fn(&str) -> Box<dyn Canvas> + Send + Sync>;

/// Canvas that keeps the last presented frame in memory. Clones share the
/// same surface, so a caller can hand one to the pipeline and inspect another.
#[derive(Debug, Clone, Default)]
pub struct MemoryCanvas {
    surface: Arc<Mutex<Surface>>,
}

#[derive(Debug, Default)]
struct Surface {
    frame: Option<Frame>,
    presented: u64,
    cleared: u64,
}

impl MemoryCanvas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presented(&self) -> u64 {
        self.surface.lock().presented
    }

    pub fn cleared(&self) -> u64 {
        self.surface.lock().cleared
    }

    pub fn frame(&self) -> Option<Frame> {
        self.surface.lock().frame.clone()
    }
}

impl Canvas for MemoryCanvas {
    fn present(&mut self, frame: &Frame) {
        let mut surface = self.surface.lock();
        surface.frame = Some(frame.clone());
        surface.presented += 1;
    }

    fn clear(&mut self) {
        let mut surface = self.surface.lock();
        surface.frame = None;
        surface.cleared += 1;
    }
}

/// Canvas that only reports frame geometry to the log.
#[derive(Debug)]
pub struct TraceCanvas {
    session_id: String,
}

impl TraceCanvas {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }

    pub fn factory() -> CanvasFactory {
        Arc::new(|session_id: &str| Box::new(TraceCanvas::new(session_id)) as Box<dyn Canvas>)
    }
}

impl Canvas for TraceCanvas {
    fn present(&mut self, frame: &Frame) {
        trace!(
            target = "frames",
            session_id = %self.session_id,
            width = frame.width,
            height = frame.height,
            "frame presented"
        );
    }

    fn clear(&mut self) {
        trace!(target = "frames", session_id = %self.session_id, "canvas cleared");
    }
}
