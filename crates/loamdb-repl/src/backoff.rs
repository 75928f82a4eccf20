//! Per-destination failure bookkeeping with exponential backoff.
//!
//! Every outbound destination carries one of these across reconnects: a
//! bounded window of recent errors, the retry counter, and the next retry
//! deadline. The timeout doubles on every error, clamped to a cap, and
//! snaps back to one second on a successful batch.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Initial retry timeout after the first error.
pub const INITIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// How many recent errors are retained per destination.
pub const ERROR_WINDOW: usize = 25;

/// A recorded connection error.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    /// Description of the error.
    pub message: String,
    /// When it happened.
    pub at: Instant,
}

/// Retry bookkeeping for one outbound destination.
#[derive(Debug)]
pub struct ConnectionShutdownInfo {
    errors: VecDeque<ErrorRecord>,
    retries: u32,
    next_timeout: Duration,
    retry_on: Option<Instant>,
    max_timeout_cap: Duration,
    /// Last heartbeat observed from the destination, if any.
    pub last_heartbeat: Option<Instant>,
    /// Database id of the destination, learned at handshake.
    pub destination_db_id: Option<String>,
}

impl ConnectionShutdownInfo {
    /// Create fresh bookkeeping with the given backoff cap.
    pub fn new(max_timeout_cap: Duration) -> Self {
        Self {
            errors: VecDeque::with_capacity(ERROR_WINDOW),
            retries: 0,
            next_timeout: INITIAL_TIMEOUT,
            retry_on: None,
            max_timeout_cap,
            last_heartbeat: None,
            destination_db_id: None,
        }
    }

    /// Record an error: remembers it in the bounded window, doubles the
    /// next timeout (clamped to the cap), and arms the retry deadline.
    /// Returns the timeout that was applied.
    pub fn on_error(&mut self, message: impl Into<String>) -> Duration {
        if self.errors.len() == ERROR_WINDOW {
            self.errors.pop_front();
        }
        self.errors.push_back(ErrorRecord {
            message: message.into(),
            at: Instant::now(),
        });
        self.retries += 1;

        let applied = self.next_timeout;
        self.retry_on = Some(Instant::now() + applied);
        self.next_timeout = (applied * 2).min(self.max_timeout_cap);
        applied
    }

    /// Reset after a successful exchange: timeout returns to the initial
    /// one second and the retry deadline is cleared. The error window is
    /// kept for operators.
    pub fn reset(&mut self) {
        self.retries = 0;
        self.next_timeout = INITIAL_TIMEOUT;
        self.retry_on = None;
    }

    /// True when the retry deadline has passed (or none is armed).
    pub fn is_due(&self, now: Instant) -> bool {
        match self.retry_on {
            Some(deadline) => deadline <= now,
            None => true,
        }
    }

    /// The armed retry deadline, if any.
    pub fn retry_on(&self) -> Option<Instant> {
        self.retry_on
    }

    /// Consecutive error count since the last reset.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// The timeout the next error will apply.
    pub fn next_timeout(&self) -> Duration {
        self.next_timeout
    }

    /// The retained error window, oldest first.
    pub fn errors(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.errors.iter()
    }
}
