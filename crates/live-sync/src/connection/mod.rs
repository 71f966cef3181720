//! Connection manager for the push channel.
//!
//! One driver task owns the socket, the [`ConnectionMachine`] and the
//! [`SubscriptionSet`]. Callers talk to it through a command channel and
//! observe it through a broadcast of [`ConnectionEvent`]s. The connection is
//! refcounted: it is dialed when the first [`ConnectionHandle`] is taken and
//! shut down when the last one drops.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until};
use tracing::{debug, error, info, trace, warn};

use crate::config::SyncConfig;
use crate::error::{ConnectionError, ProtocolError};
use crate::protocol::{ClientMessage, Inbound, PushEvent, parse_inbound};
use crate::telemetry::preview;

pub mod state;
pub mod subscriptions;
pub mod transport;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod mock;

pub use state::{Backoff, ConnectionMachine, ConnectionState, Effect, Input};
pub use subscriptions::SubscriptionSet;
pub use transport::{PushSocket, PushTransport, SocketMessage, WebSocketTransport, WsChannel};
pub use watchdog::{Indicator, Watchdog};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    State(ConnectionState),
    Push(PushEvent),
    /// Reconnecting gave up; nothing more will arrive until a new connect.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub watchdog_ceiling: Duration,
}

impl ConnectionOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            backoff_initial: config.backoff_initial,
            backoff_max: config.backoff_max,
            max_reconnect_attempts: config.max_reconnect_attempts,
            heartbeat_interval: config.heartbeat_interval,
            watchdog_ceiling: config.watchdog_ceiling,
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[derive(Debug)]
enum Command {
    Connect,
    Shutdown,
    Subscribe(String),
    Unsubscribe(String),
}

/// Owner of the push connection of one client instance.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ConnectionEvent>,
    state: watch::Receiver<ConnectionState>,
    watchdog: Watchdog,
    lease: Mutex<Weak<Lease>>,
}

impl ConnectionManager {
    /// Spawns the driver task. Must be called inside a tokio runtime; the
    /// driver shuts the socket down and exits once every clone is dropped.
    pub fn new(transport: Arc<dyn PushTransport>, options: ConnectionOptions) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);
        let watchdog = Watchdog::new(options.watchdog_ceiling);

        let driver = Driver {
            transport,
            machine: ConnectionMachine::new(Backoff::new(
                options.backoff_initial,
                options.backoff_max,
                options.max_reconnect_attempts,
            )),
            subscriptions: SubscriptionSet::default(),
            socket: None,
            dialing: None,
            retry_at: None,
            heartbeat_every: options.heartbeat_interval,
            events: events.clone(),
            state: state_tx,
            watchdog: watchdog.clone(),
        };
        tokio::spawn(driver.run(commands_rx));

        Self {
            inner: Arc::new(ManagerInner {
                commands: commands_tx,
                events,
                state: state_rx,
                watchdog,
                lease: Mutex::new(Weak::new()),
            }),
        }
    }

    /// Returns a handle to the shared connection, dialing it if this is the
    /// first live handle.
    pub fn connect(&self) -> ConnectionHandle {
        let mut lease = self.inner.lease.lock();
        if let Some(existing) = lease.upgrade() {
            return ConnectionHandle { lease: existing };
        }
        let fresh = Arc::new(Lease {
            manager: Arc::clone(&self.inner),
        });
        let _ = self.inner.commands.send(Command::Connect);
        *lease = Arc::downgrade(&fresh);
        ConnectionHandle { lease: fresh }
    }

    /// Number of live handles.
    pub fn ref_count(&self) -> usize {
        self.inner.lease.lock().strong_count()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn indicator(&self) -> watch::Receiver<Indicator> {
        self.inner.watchdog.subscribe()
    }
}

struct Lease {
    manager: Arc<ManagerInner>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let lease = self.manager.lease.lock();
        // a concurrent connect may already have installed a new lease
        if lease.strong_count() == 0 {
            let _ = self.manager.commands.send(Command::Shutdown);
        }
    }
}

/// A live reference to the shared connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    lease: Arc<Lease>,
}

impl ConnectionHandle {
    /// Subscribes to push events of a study. Queued until the socket opens;
    /// a no-op when already subscribed.
    pub fn subscribe(&self, study_id: impl Into<String>) {
        let _ = self
            .lease
            .manager
            .commands
            .send(Command::Subscribe(study_id.into()));
    }

    pub fn unsubscribe(&self, study_id: impl Into<String>) {
        let _ = self
            .lease
            .manager
            .commands
            .send(Command::Unsubscribe(study_id.into()));
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.lease.manager.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.lease.manager.state.borrow()
    }
}

type DialResult = Result<Box<dyn PushSocket>, ConnectionError>;

struct Driver {
    transport: Arc<dyn PushTransport>,
    machine: ConnectionMachine,
    subscriptions: SubscriptionSet,
    socket: Option<Box<dyn PushSocket>>,
    dialing: Option<JoinHandle<DialResult>>,
    retry_at: Option<Instant>,
    heartbeat_every: Duration,
    events: broadcast::Sender<ConnectionEvent>,
    state: watch::Sender<ConnectionState>,
    watchdog: Watchdog,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut heartbeat = heartbeat_interval(self.heartbeat_every);
        loop {
            let open = self.machine.state() == ConnectionState::Open;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                dialed = wait_dial(&mut self.dialing) => {
                    self.dialing = None;
                    self.on_dialed(dialed, &mut heartbeat).await;
                }
                message = wait_message(&mut self.socket) => self.on_message(message).await,
                _ = wait_until(self.retry_at) => {
                    self.retry_at = None;
                    self.apply(Input::RetryElapsed).await;
                }
                _ = heartbeat.tick(), if open => self.send_heartbeat().await,
            }
        }
        self.apply(Input::Shutdown).await;
        debug!(target = "connection", "connection driver stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.apply(Input::Connect).await,
            Command::Shutdown => {
                self.apply(Input::Shutdown).await;
                self.subscriptions.clear();
            }
            Command::Subscribe(study_id) => {
                let open = self.machine.state() == ConnectionState::Open;
                if !self.subscriptions.insert(&study_id, open) {
                    trace!(
                        target = "connection",
                        study_id = %study_id,
                        open,
                        "subscription queued or already present"
                    );
                    return;
                }
                if let Err(err) = self.send(ClientMessage::Subscribe { study_id }).await {
                    warn!(target = "connection", error = %err, "subscribe failed");
                    self.apply(Input::Dropped).await;
                }
            }
            Command::Unsubscribe(study_id) => {
                let was_active = self.subscriptions.remove(&study_id);
                if !was_active || self.machine.state() != ConnectionState::Open {
                    return;
                }
                if let Err(err) = self.send(ClientMessage::Unsubscribe { study_id }).await {
                    warn!(target = "connection", error = %err, "unsubscribe failed");
                    self.apply(Input::Dropped).await;
                }
            }
        }
    }

    async fn on_dialed(&mut self, dialed: DialResult, heartbeat: &mut Interval) {
        match dialed {
            Ok(socket) => {
                self.socket = Some(socket);
                heartbeat.reset();
                self.apply(Input::Opened).await;
            }
            Err(err) => {
                warn!(target = "connection", error = %err, "push channel dial failed");
                self.apply(Input::Dropped).await;
            }
        }
    }

    async fn on_message(&mut self, message: Option<SocketMessage>) {
        let text = match message {
            Some(SocketMessage::Text(text)) => text,
            Some(SocketMessage::Binary(data)) => {
                warn!(
                    target = "connection",
                    error = %ProtocolError::UnexpectedBinary,
                    bytes = data.len(),
                    "dropping push message"
                );
                return;
            }
            None => {
                info!(target = "connection", "push channel closed");
                self.apply(Input::Dropped).await;
                return;
            }
        };

        match parse_inbound(&text) {
            Ok(Inbound::Event(event)) => {
                trace!(
                    target = "connection",
                    event = event.kind(),
                    study_id = %event.study_id(),
                    "push event received"
                );
                let _ = self.events.send(ConnectionEvent::Push(event));
            }
            Ok(Inbound::Control(kind)) => {
                trace!(target = "connection", kind = %kind, "control message received");
            }
            Err(err) => {
                warn!(
                    target = "connection",
                    error = %err,
                    message = %preview(&text, 160),
                    "dropping push message"
                );
            }
        }
    }

    async fn send_heartbeat(&mut self) {
        match self.send(ClientMessage::Ping).await {
            Ok(()) => trace!(target = "connection", "heartbeat sent"),
            Err(err) => {
                debug!(target = "connection", error = %err, "heartbeat failed");
                self.apply(Input::Dropped).await;
            }
        }
    }

    async fn send(&mut self, message: ClientMessage) -> Result<(), ConnectionError> {
        let text = message
            .to_text()
            .map_err(|err| ConnectionError::Send(err.to_string()))?;
        let socket = self.socket.as_mut().ok_or(ConnectionError::Closed)?;
        socket.send_text(text).await
    }

    /// Feeds an input to the machine and performs the resulting effects.
    /// Effects that fail turn into follow-up inputs.
    async fn apply(&mut self, input: Input) {
        let mut queue = VecDeque::from([input]);
        while let Some(input) = queue.pop_front() {
            let before = self.machine.state();
            let effects = self.machine.handle(input);
            let after = self.machine.state();
            if before != after {
                debug!(
                    target = "connection",
                    from = before.as_str(),
                    to = after.as_str(),
                    ?input,
                    "connection state changed"
                );
                self.state.send_replace(after);
                let _ = self.events.send(ConnectionEvent::State(after));
            }
            for effect in effects {
                if let Some(follow_up) = self.perform(effect).await {
                    queue.push_back(follow_up);
                    break;
                }
            }
        }
    }

    async fn perform(&mut self, effect: Effect) -> Option<Input> {
        match effect {
            Effect::Dial => {
                let transport = Arc::clone(&self.transport);
                self.dialing = Some(tokio::spawn(async move { transport.connect().await }));
            }
            Effect::Opened => {
                let ids = self.subscriptions.flush();
                info!(
                    target = "connection",
                    resubscribed = ids.len(),
                    "push channel open"
                );
                for study_id in ids {
                    if let Err(err) = self.send(ClientMessage::Subscribe { study_id }).await {
                        warn!(target = "connection", error = %err, "resubscribe failed");
                        return Some(Input::Dropped);
                    }
                }
            }
            Effect::Disconnected => {
                self.retry_at = None;
                if let Some(dialing) = self.dialing.take() {
                    dialing.abort();
                }
                if let Some(mut socket) = self.socket.take() {
                    socket.close().await;
                }
                self.subscriptions.suspend();
            }
            Effect::ScheduleRetry { attempt, delay } => {
                warn!(
                    target = "connection",
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "push channel lost; scheduling reconnect"
                );
                self.retry_at = Some(Instant::now() + delay);
            }
            Effect::GiveUp { attempts } => {
                error!(
                    target = "connection",
                    error = %ConnectionError::Exhausted { attempts },
                    "exhausted reconnect attempts"
                );
                let _ = self.events.send(ConnectionEvent::Exhausted { attempts });
            }
            Effect::ArmWatchdog => self.watchdog.arm("connecting"),
            Effect::ClearWatchdog => self.watchdog.clear(),
        }
        None
    }
}

fn heartbeat_interval(every: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + every, every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn wait_dial(dialing: &mut Option<JoinHandle<DialResult>>) -> DialResult {
    match dialing {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(err) => Err(ConnectionError::Dial(err.to_string())),
        },
        None => std::future::pending().await,
    }
}

async fn wait_message(socket: &mut Option<Box<dyn PushSocket>>) -> Option<SocketMessage> {
    match socket {
        Some(socket) => socket.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;
    use serde_json::json;

    fn options(max_reconnect_attempts: u32) -> ConnectionOptions {
        ConnectionOptions {
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
            max_reconnect_attempts,
            heartbeat_interval: Duration::from_secs(600),
            watchdog_ceiling: Duration::from_secs(15),
        }
    }

    fn manager(transport: &MockTransport, max_reconnect_attempts: u32) -> ConnectionManager {
        ConnectionManager::new(Arc::new(transport.clone()), options(max_reconnect_attempts))
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
    async fn subscriptions_queued_while_connecting_flush_once_on_open() {
        let transport = MockTransport::new();
        let manager = manager(&transport, 0);
        let handle = manager.connect();
        handle.subscribe("st-1");
        handle.subscribe("st-1");
        handle.subscribe("st-2");

        eventually(|| transport.subscribes().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.subscribes(), vec!["st-1", "st-2"]);
        assert_eq!(manager.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resubscribes_exactly_the_active_set() {
        let transport = MockTransport::new();
        let manager = manager(&transport, 0);
        let handle = manager.connect();
        handle.subscribe("st-a");
        handle.subscribe("st-b");
        handle.subscribe("st-c");
        eventually(|| transport.subscribes().len() == 3).await;
        handle.unsubscribe("st-b");
        eventually(|| transport.sent().len() == 4).await;

        transport.fail_next(1);
        transport.drop_socket();
        eventually(|| transport.dials() == 3 && transport.subscribes().len() == 5).await;

        let replayed = transport.subscribes()[3..].to_vec();
        assert_eq!(replayed, vec!["st-a", "st-c"]);
        assert_eq!(manager.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_is_surfaced_after_the_attempt_budget() {
        let transport = MockTransport::new();
        transport.fail_next(100);
        let manager = manager(&transport, 3);
        let mut events = manager.events();
        let _handle = manager.connect();

        let attempts = loop {
            match events.recv().await.unwrap() {
                ConnectionEvent::Exhausted { attempts } => break attempts,
                _ => continue,
            }
        };
        assert_eq!(attempts, 3);
        assert_eq!(transport.dials(), 4);
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn handles_share_one_connection_and_the_last_drop_closes_it() {
        let transport = MockTransport::new();
        let manager = manager(&transport, 0);
        let first = manager.connect();
        let second = manager.connect();
        assert_eq!(manager.ref_count(), 2);
        eventually(|| manager.state() == ConnectionState::Open).await;
        assert_eq!(transport.dials(), 1);

        drop(first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(transport.is_connected());

        drop(second);
        eventually(|| manager.state() == ConnectionState::Closed).await;
        assert_eq!(transport.closed(), 1);
        assert_eq!(manager.ref_count(), 0);

        let _again = manager.connect();
        eventually(|| manager.state() == ConnectionState::Open).await;
        assert_eq!(transport.dials(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn push_events_are_broadcast_and_garbage_is_dropped() {
        let transport = MockTransport::new();
        let manager = manager(&transport, 0);
        let mut events = manager.events();
        let _handle = manager.connect();
        eventually(|| transport.is_connected()).await;

        transport.push_text("{not json");
        transport.push_binary(vec![1, 2, 3]);
        transport.push_text(r#"{"type":"pong"}"#);
        transport.push_text(
            json!({"type": "study:analyzing", "study_id": "st-1"}).to_string(),
        );

        let event = loop {
            match events.recv().await.unwrap() {
                ConnectionEvent::Push(event) => break event,
                _ => continue,
            }
        };
        assert_eq!(event.kind(), "study:analyzing");
        assert_eq!(manager.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_while_open() {
        let transport = MockTransport::new();
        let manager = ConnectionManager::new(
            Arc::new(transport.clone()),
            ConnectionOptions {
                heartbeat_interval: Duration::from_secs(25),
                ..options(0)
            },
        );
        let _handle = manager.connect();
        eventually(|| transport.is_connected()).await;

        tokio::time::sleep(Duration::from_secs(51)).await;
        let pings = transport
            .sent()
            .into_iter()
            .filter(|message| *message == ClientMessage::Ping)
            .count();
        assert_eq!(pings, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_indicator_is_idle_once_open() {
        let transport = MockTransport::new();
        let manager = manager(&transport, 0);
        let indicator = manager.indicator();
        let _handle = manager.connect();
        eventually(|| manager.state() == ConnectionState::Open).await;
        assert_eq!(*indicator.borrow(), Indicator::Idle);
    }
}
