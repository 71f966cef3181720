use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Busy indicator shown while something is connecting or navigating.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "label", rename_all = "snake_case")]
pub enum Indicator {
    #[default]
    Idle,
    Busy(String),
}

/// Clears a busy [`Indicator`] after a fixed ceiling even if nothing else
/// ever does, so the indicator cannot get stuck.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<WatchdogInner>,
}

struct WatchdogInner {
    ceiling: Duration,
    indicator: watch::Sender<Indicator>,
    generation: AtomicU64,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub fn new(ceiling: Duration) -> Self {
        let (indicator, _) = watch::channel(Indicator::Idle);
        Self {
            inner: Arc::new(WatchdogInner {
                ceiling,
                indicator,
                generation: AtomicU64::new(0),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Shows `label` as busy and (re)starts the ceiling timer.
    pub fn arm(&self, label: impl Into<String>) {
        let label = label.into();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.indicator.send_replace(Indicator::Busy(label.clone()));

        let inner = Arc::downgrade(&self.inner);
        let ceiling = self.inner.ceiling;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(ceiling).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if inner.generation.load(Ordering::SeqCst) == generation {
                warn!(
                    target = "watchdog",
                    label = %label,
                    ceiling_ms = ceiling.as_millis() as u64,
                    "busy indicator cleared by watchdog"
                );
                inner.indicator.send_replace(Indicator::Idle);
            }
        });
        if let Some(previous) = self.inner.timer.lock().replace(timer) {
            previous.abort();
        }
    }

    pub fn clear(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.abort();
        }
        self.inner.indicator.send_if_modified(|current| {
            if *current == Indicator::Idle {
                false
            } else {
                *current = Indicator::Idle;
                true
            }
        });
    }

    pub fn current(&self) -> Indicator {
        self.inner.indicator.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Indicator> {
        self.inner.indicator.subscribe()
    }
}

impl Drop for WatchdogInner {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.abort();
        }
    }
}
