use async_trait::async_trait;
use url::Url;

use crate::connection::{PushSocket, SocketMessage, WsChannel};
use crate::error::ConnectionError;

/// Opens the per-session screencast channel.
#[async_trait]
pub trait FrameSource: Send + Sync + 'static {
    async fn open(&self, session_id: &str) -> Result<Box<dyn FrameStream>, ConnectionError>;
}

/// An open screencast channel. `next` must be cancel-safe.
#[async_trait]
pub trait FrameStream: Send {
    /// `None` once the channel is closed.
    async fn next(&mut self) -> Option<SocketMessage>;

    async fn close(&mut self);
}

/// Screencast over one websocket per session at `{frames_url}/{session_id}`.
pub struct WebSocketFrameSource {
    frames_url: String,
}

impl WebSocketFrameSource {
    pub fn new(frames_url: impl Into<String>) -> Self {
        Self {
            frames_url: frames_url.into(),
        }
    }

    pub fn endpoint(&self, session_id: &str) -> Result<Url, ConnectionError> {
        let raw = format!("{}/{}", self.frames_url.trim_end_matches('/'), session_id);
        Url::parse(&raw).map_err(|err| ConnectionError::Dial(format!("invalid frames url {raw}: {err}")))
    }
}

#[async_trait]
impl FrameSource for WebSocketFrameSource {
    async fn open(&self, session_id: &str) -> Result<Box<dyn FrameStream>, ConnectionError> {
        let url = self.endpoint(session_id)?;
        let channel = WsChannel::dial(&url).await?;
        Ok(Box::new(channel))
    }
}

#[async_trait]
impl FrameStream for WsChannel {
    async fn next(&mut self) -> Option<SocketMessage> {
        PushSocket::recv(self).await
    }

    async fn close(&mut self) {
        PushSocket::close(self).await
    }
}
