use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, trace};
use url::Url;

use crate::error::ConnectionError;

/// How long `close` waits for the peer to acknowledge before dropping.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// One message read off a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Opens sockets for the push channel.
#[async_trait]
pub trait PushTransport: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn PushSocket>, ConnectionError>;
}

/// An open socket. `recv` must be cancel-safe: the connection driver polls it
/// inside `select!`.
#[async_trait]
pub trait PushSocket: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError>;

    /// `None` once the socket is closed.
    async fn recv(&mut self) -> Option<SocketMessage>;

    async fn close(&mut self);
}

pub struct WebSocketTransport {
    url: Url,
}

impl WebSocketTransport {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl PushTransport for WebSocketTransport {
    async fn connect(&self) -> Result<Box<dyn PushSocket>, ConnectionError> {
        let channel = WsChannel::dial(&self.url).await?;
        Ok(Box::new(channel))
    }
}

/// A websocket split into a writer task and a reader task, bridged to the
/// caller through unbounded channels.
pub struct WsChannel {
    outgoing: mpsc::UnboundedSender<Message>,
    incoming: mpsc::UnboundedReceiver<SocketMessage>,
    task: Option<JoinHandle<()>>,
}

impl WsChannel {
    pub async fn dial(url: &Url) -> Result<Self, ConnectionError> {
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ConnectionError::Dial(format!("{url}: {err}")))?;
        debug!(target = "connection", url = %url, "websocket connected");

        let (tx_out, rx_out) = mpsc::unbounded_channel::<Message>();
        let (tx_in, rx_in) = mpsc::unbounded_channel::<SocketMessage>();
        let task = tokio::spawn(handle_websocket(stream, rx_out, tx_in));

        Ok(Self {
            outgoing: tx_out,
            incoming: rx_in,
            task: Some(task),
        })
    }
}

#[async_trait]
impl PushSocket for WsChannel {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError> {
        self.outgoing
            .send(Message::Text(text))
            .map_err(|_| ConnectionError::Send("websocket writer stopped".into()))
    }

    async fn recv(&mut self) -> Option<SocketMessage> {
        self.incoming.recv().await
    }

    async fn close(&mut self) {
        let _ = self.outgoing.send(Message::Close(None));
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn handle_websocket(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<Message>,
    tx_in: mpsc::UnboundedSender<SocketMessage>,
) {
    let (mut sink, mut source) = stream.split();

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx_out.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(err) = sink.send(message).await {
                debug!(target = "connection", error = %err, "websocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    while let Some(message) = source.next().await {
        let forwarded = match message {
            Ok(Message::Text(text)) => tx_in.send(SocketMessage::Text(text)),
            Ok(Message::Binary(data)) => tx_in.send(SocketMessage::Binary(data)),
            Ok(Message::Close(frame)) => {
                trace!(target = "connection", ?frame, "websocket closed by peer");
                break;
            }
            Ok(_) => Ok(()),
            Err(err) => {
                debug!(target = "connection", error = %err, "websocket read failed");
                break;
            }
        };
        if forwarded.is_err() {
            break;
        }
    }

    send_task.abort();
    let _ = send_task.await;
}
