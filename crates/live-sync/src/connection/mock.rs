use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::transport::{PushSocket, PushTransport, SocketMessage};
use crate::error::ConnectionError;
use crate::protocol::ClientMessage;

/// In-memory push transport. Each dial yields a socket the test can feed,
/// drop, or inspect.
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    inner: Arc<Mutex<MockInner>>,
}

#[derive(Default)]
struct MockInner {
    failures: u32,
    dials: u32,
    generation: u64,
    peer: Option<mpsc::UnboundedSender<SocketMessage>>,
    sent: Vec<ClientMessage>,
    closed: u32,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_next(&self, dials: u32) {
        self.inner.lock().failures = dials;
    }

    pub(crate) fn dials(&self) -> u32 {
        self.inner.lock().dials
    }

    pub(crate) fn closed(&self) -> u32 {
        self.inner.lock().closed
    }

    pub(crate) fn sent(&self) -> Vec<ClientMessage> {
        self.inner.lock().sent.clone()
    }

    pub(crate) fn subscribes(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|message| match message {
                ClientMessage::Subscribe { study_id } => Some(study_id),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.inner.lock().peer.is_some()
    }

    /// Delivers a text frame on the current socket.
    pub(crate) fn push_text(&self, text: impl Into<String>) -> bool {
        match self.inner.lock().peer.as_ref() {
            Some(peer) => peer.send(SocketMessage::Text(text.into())).is_ok(),
            None => false,
        }
    }

    pub(crate) fn push_binary(&self, data: Vec<u8>) -> bool {
        match self.inner.lock().peer.as_ref() {
            Some(peer) => peer.send(SocketMessage::Binary(data)).is_ok(),
            None => false,
        }
    }

    /// Simulates the server dropping the current socket.
    pub(crate) fn drop_socket(&self) {
        let mut inner = self.inner.lock();
        inner.peer = None;
        inner.generation += 1;
    }
}

#[async_trait]
impl PushTransport for MockTransport {
    async fn connect(&self) -> Result<Box<dyn PushSocket>, ConnectionError> {
        let mut inner = self.inner.lock();
        inner.dials += 1;
        if inner.failures > 0 {
            inner.failures -= 1;
            return Err(ConnectionError::Dial("mock refused".into()));
        }
        let (peer, incoming) = mpsc::unbounded_channel();
        inner.generation += 1;
        inner.peer = Some(peer);
        Ok(Box::new(MockSocket {
            generation: inner.generation,
            incoming,
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MockSocket {
    generation: u64,
    incoming: mpsc::UnboundedReceiver<SocketMessage>,
    inner: Arc<Mutex<MockInner>>,
}

#[async_trait]
impl PushSocket for MockSocket {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError> {
        let mut inner = self.inner.lock();
        if inner.generation != self.generation || inner.peer.is_none() {
            return Err(ConnectionError::Closed);
        }
        let message = serde_json::from_str(&text)
            .map_err(|err| ConnectionError::Send(err.to_string()))?;
        inner.sent.push(message);
        Ok(())
    }

    async fn recv(&mut self) -> Option<SocketMessage> {
        self.incoming.recv().await
    }

    async fn close(&mut self) {
        let mut inner = self.inner.lock();
        inner.closed += 1;
        if inner.generation == self.generation {
            inner.peer = None;
        }
    }
}
