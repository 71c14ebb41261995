use std::collections::HashSet;
use std::time::Duration;

use ircgate_types::Timestamp;

/// How long a sent message waits for its echo before being forgotten.
pub const ECHO_HORIZON: Duration = Duration::from_secs(10);

/// Timestamps of messages this gateway posted.
///
/// An entry leaves the set either because its echo was seen (`consume`) or
/// because it aged past the horizon (`purge`), never both.
#[derive(Debug, Default)]
pub struct EchoFilter {
    sent: HashSet<Timestamp>,
}

impl EchoFilter {
    pub fn record(&mut self, ts: Timestamp) {
        self.sent.insert(ts);
    }

    /// True exactly once per recorded timestamp.
    pub fn consume(&mut self, ts: Timestamp) -> bool {
        self.sent.remove(&ts)
    }

    /// Forgets entries at least `ECHO_HORIZON` older than `now`. Returns how
    /// many were dropped.
    pub fn purge(&mut self, now: Timestamp) -> usize {
        let before = self.sent.len();
        self.sent.retain(|ts| ts.elapsed_until(now) < ECHO_HORIZON);
        before - self.sent.len()
    }

    pub fn len(&self) -> usize {
        self.sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }
}
