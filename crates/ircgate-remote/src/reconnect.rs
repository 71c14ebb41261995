use std::fmt::Display;
use std::time::Duration;

use serde_json::Value;
use tokio::time::{Instant, sleep_until};
use tracing::{info, warn};

use ircgate_types::RemoteEvent;

use crate::error::TransportError;
use crate::state::RemoteState;

const MAX_BACKOFF: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Connected,
    Backoff,
}

/// What woke the link up. Returned by [`ReconnectLoop::wait`] and consumed
/// by [`ReconnectLoop::handle`].
#[derive(Debug)]
pub enum Wake {
    /// Time to (re)open the stream.
    Connect,
    Events(Vec<Value>),
    /// Events are already queued on the state.
    Pending,
    Lost(TransportError),
}

/// Keeps the event stream open, backing off exponentially while the remote
/// is unreachable.
#[derive(Debug)]
pub struct ReconnectLoop {
    state: LinkState,
    failures: u32,
    resume_at: Option<Instant>,
}

impl Default for ReconnectLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectLoop {
    pub fn new() -> Self {
        Self {
            state: LinkState::Idle,
            failures: 0,
            resume_at: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// 1s after the first failure, doubling up to two minutes.
    pub fn backoff_delay(failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let secs = 1u64.checked_shl(failures - 1).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(MAX_BACKOFF)
    }

    /// Waits until there is something to do.
    ///
    /// Cancel-safe: the backoff deadline is stored, not restarted, and
    /// stream reads are cancel-safe themselves. Nothing is mutated here.
    pub async fn wait(&self, remote: &RemoteState) -> Wake {
        if remote.has_pending() {
            return Wake::Pending;
        }
        match self.state {
            LinkState::Idle | LinkState::Connecting => Wake::Connect,
            LinkState::Backoff => {
                if let Some(at) = self.resume_at {
                    sleep_until(at).await;
                }
                Wake::Connect
            }
            LinkState::Connected => match remote.transport().rtm_read().await {
                Ok(batch) => Wake::Events(batch),
                Err(e) => Wake::Lost(e),
            },
        }
    }

    /// Acts on a wake-up and returns whatever events became ready.
    pub async fn handle(&mut self, wake: Wake, remote: &mut RemoteState) -> Vec<RemoteEvent> {
        match wake {
            Wake::Connect => {
                self.connect(remote).await;
            }
            Wake::Events(batch) => remote.ingest(batch).await,
            Wake::Lost(e) => self.fail(e),
            Wake::Pending => {}
        }
        remote.drain_events()
    }

    /// Waits and handles until at least one event is ready.
    pub async fn next_events(&mut self, remote: &mut RemoteState) -> Vec<RemoteEvent> {
        loop {
            let wake = self.wait(remote).await;
            let events = self.handle(wake, remote).await;
            if !events.is_empty() {
                return events;
            }
        }
    }

    /// Opens the stream and replays missed history. On failure the link
    /// enters backoff.
    pub async fn connect(&mut self, remote: &mut RemoteState) -> bool {
        self.state = LinkState::Connecting;
        match remote.connect_stream().await {
            Ok(()) => {
                if self.failures > 0 {
                    info!("Event stream reconnected after {} failures", self.failures);
                } else {
                    info!("Event stream connected");
                }
                self.state = LinkState::Connected;
                self.failures = 0;
                self.resume_at = None;
                true
            }
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    pub fn fail(&mut self, reason: impl Display) {
        self.failures = self.failures.saturating_add(1);
        let delay = Self::backoff_delay(self.failures);
        warn!("Event stream down ({}), retrying in {:?}", reason, delay);
        self.resume_at = Some(Instant::now() + delay);
        self.state = LinkState::Backoff;
    }
}
