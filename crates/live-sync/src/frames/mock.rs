use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::source::{FrameSource, FrameStream};
use crate::connection::SocketMessage;
use crate::error::ConnectionError;

/// In-memory screencast source keyed by session id.
#[derive(Clone, Default)]
pub(crate) struct MockFrameSource {
    inner: Arc<Mutex<MockFrames>>,
}

#[derive(Default)]
struct MockFrames {
    feeds: HashMap<String, mpsc::UnboundedSender<SocketMessage>>,
    opened: Vec<String>,
    closed: Vec<String>,
    refuse: bool,
}

impl MockFrameSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn refuse_all(&self) {
        self.inner.lock().refuse = true;
    }

    pub(crate) fn send_frame(&self, session_id: &str, bytes: Vec<u8>) -> bool {
        self.send(session_id, SocketMessage::Binary(bytes))
    }

    pub(crate) fn send(&self, session_id: &str, message: SocketMessage) -> bool {
        match self.inner.lock().feeds.get(session_id) {
            Some(feed) => feed.send(message).is_ok(),
            None => false,
        }
    }

    pub(crate) fn is_open(&self, session_id: &str) -> bool {
        self.inner
            .lock()
            .feeds
            .get(session_id)
            .is_some_and(|feed| !feed.is_closed())
    }

    pub(crate) fn opened(&self) -> Vec<String> {
        self.inner.lock().opened.clone()
    }

    pub(crate) fn closed(&self) -> Vec<String> {
        self.inner.lock().closed.clone()
    }
}

#[async_trait]
impl FrameSource for MockFrameSource {
    async fn open(&self, session_id: &str) -> Result<Box<dyn FrameStream>, ConnectionError> {
        let mut inner = self.inner.lock();
        if inner.refuse {
            return Err(ConnectionError::Dial("mock screencast refused".into()));
        }
        let (feed, incoming) = mpsc::unbounded_channel();
        inner.feeds.insert(session_id.to_owned(), feed);
        inner.opened.push(session_id.to_owned());
        Ok(Box::new(MockFrameStream {
            session_id: session_id.to_owned(),
            incoming,
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MockFrameStream {
    session_id: String,
    incoming: mpsc::UnboundedReceiver<SocketMessage>,
    inner: Arc<Mutex<MockFrames>>,
}

#[async_trait]
impl FrameStream for MockFrameStream {
    async fn next(&mut self) -> Option<SocketMessage> {
        self.incoming.recv().await
    }

    async fn close(&mut self) {
        self.incoming.close();
        self.inner.lock().closed.push(self.session_id.clone());
    }
}
