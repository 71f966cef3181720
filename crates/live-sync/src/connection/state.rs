use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[default]
    Closed,
    Connecting,
    Open,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// A caller wants the connection up.
    Connect,
    /// The dial succeeded.
    Opened,
    /// The dial failed or an open socket went away.
    Dropped,
    /// The scheduled reconnect delay ran out.
    RetryElapsed,
    /// The last caller released the connection.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Dial,
    /// The socket is usable: flush queued subscriptions.
    Opened,
    /// Release the socket and any in-flight dial.
    Disconnected,
    ScheduleRetry { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
    ArmWatchdog,
    ClearWatchdog,
}

/// Exponential reconnect delay, doubled per consecutive failure and capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_attempts: u32,
    attempts: u32,
    delay: Duration,
}

impl Backoff {
    /// `max_attempts == 0` retries forever.
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            max_attempts,
            attempts: 0,
            delay: initial,
        }
    }

    pub fn next(&mut self) -> Option<(u32, Duration)> {
        if self.max_attempts != 0 && self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        let delay = self.delay;
        self.delay = (self.delay * 2).min(self.max);
        Some((self.attempts, delay))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.delay = self.initial;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Connection lifecycle as an explicit transition table. Pure: the driver
/// performs the returned effects.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    backoff: Backoff,
    retry_pending: bool,
}

impl ConnectionMachine {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: ConnectionState::Closed,
            backoff,
            retry_pending: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        use ConnectionState::*;

        match (self.state, input) {
            (Closed, Input::Connect) => {
                self.backoff.reset();
                self.retry_pending = false;
                self.state = Connecting;
                vec![Effect::Dial, Effect::ArmWatchdog]
            }
            (Closed, Input::RetryElapsed) if self.retry_pending => {
                self.retry_pending = false;
                self.state = Connecting;
                vec![Effect::Dial, Effect::ArmWatchdog]
            }
            (Connecting, Input::Opened) => {
                self.backoff.reset();
                self.state = Open;
                vec![Effect::ClearWatchdog, Effect::Opened]
            }
            (Connecting | Open, Input::Dropped) => {
                self.state = Closed;
                let mut effects = vec![Effect::Disconnected, Effect::ClearWatchdog];
                match self.backoff.next() {
                    Some((attempt, delay)) => {
                        self.retry_pending = true;
                        effects.push(Effect::ScheduleRetry { attempt, delay });
                    }
                    None => effects.push(Effect::GiveUp {
                        attempts: self.backoff.attempts(),
                    }),
                }
                effects
            }
            (_, Input::Shutdown) => {
                self.state = Closed;
                self.retry_pending = false;
                self.backoff.reset();
                vec![Effect::Disconnected, Effect::ClearWatchdog]
            }
            _ => Vec::new(),
        }
    }
}
