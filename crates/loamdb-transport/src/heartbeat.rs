//! Heartbeat liveness tracking.
//!
//! Both replication directions and subscription connections send periodic
//! heartbeats while idle. A peer silent for `max_inactive` is declared
//! dead and its connection is torn down.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Heartbeat timing configuration.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often a heartbeat is sent while idle.
    pub interval: Duration,
    /// Silence longer than this declares the peer dead.
    pub max_inactive: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_inactive: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    /// Clamp the interval so it can never starve the liveness window.
    pub fn normalized(mut self) -> Self {
        let floor = Duration::from_millis(50);
        if self.interval < floor {
            self.interval = floor;
        }
        if self.max_inactive < self.interval {
            self.max_inactive = self.interval * 2;
        }
        self
    }
}

/// Tracks when a peer was last heard from.
#[derive(Debug)]
pub struct HeartbeatClock {
    last_seen: Mutex<Instant>,
    max_inactive: Duration,
}

impl HeartbeatClock {
    /// Create a clock that considers the peer alive as of now.
    pub fn new(max_inactive: Duration) -> Self {
        Self {
            last_seen: Mutex::new(Instant::now()),
            max_inactive,
        }
    }

    /// Record activity from the peer.
    pub fn touch(&self) {
        *self.last_seen.lock().expect("lock poisoned") = Instant::now();
    }

    /// Time since the peer was last heard from.
    pub fn elapsed(&self) -> Duration {
        self.last_seen.lock().expect("lock poisoned").elapsed()
    }

    /// True while the peer is within its liveness window.
    pub fn is_alive(&self) -> bool {
        self.elapsed() <= self.max_inactive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_clock_is_alive() {
        let clock = HeartbeatClock::new(Duration::from_secs(60));
        assert!(clock.is_alive());
        assert!(clock.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_stale_clock_is_dead() {
        let clock = HeartbeatClock::new(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!clock.is_alive());
    }

    #[test]
    fn test_touch_revives() {
        let clock = HeartbeatClock::new(Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!clock.is_alive());
        clock.touch();
        assert!(clock.is_alive());
    }

    #[test]
    fn test_config_normalization() {
        let cfg = HeartbeatConfig {
            interval: Duration::from_millis(1),
            max_inactive: Duration::from_millis(1),
        }
        .normalized();
        assert!(cfg.interval >= Duration::from_millis(50));
        assert!(cfg.max_inactive >= cfg.interval);
    }
}
