//! Statistics

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;

/// Thread-safe counters shared by every session of a listener.
#[derive(Default)]
pub struct Stats {
    // Global counters
    sessions: AtomicU64,
    fallbacks: AtomicU64,
    tunnels: AtomicU64,

    // Per-user stats
    user_stats: DashMap<String, UserStats>,

    // Start time
    start_time: RwLock<Option<Instant>>,
}

#[derive(Default)]
pub struct UserStats {
    pub tunnels: AtomicU64,
    pub octets_up: AtomicU64,
    pub octets_down: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        let stats = Self::default();
        *stats.start_time.write() = Some(Instant::now());
        stats
    }

    pub fn session_opened(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fallback_started(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_established(&self, user: &str) {
        self.tunnels.fetch_add(1, Ordering::Relaxed);
        self.user_stats
            .entry(user.to_string())
            .or_default()
            .tunnels
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_octets(&self, user: &str, up: u64, down: u64) {
        let entry = self.user_stats.entry(user.to_string()).or_default();
        entry.octets_up.fetch_add(up, Ordering::Relaxed);
        entry.octets_down.fetch_add(down, Ordering::Relaxed);
    }

    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    pub fn fallbacks(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    pub fn tunnels(&self) -> u64 {
        self.tunnels.load(Ordering::Relaxed)
    }

    pub fn user_octets(&self, user: &str) -> u64 {
        self.user_stats
            .get(user)
            .map(|s| s.octets_up.load(Ordering::Relaxed) + s.octets_down.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn uptime_secs(&self) -> f64 {
        self.start_time
            .read()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_shared_counters() {
        let stats = Arc::new(Stats::new());

        let a = Arc::clone(&stats);
        let b = Arc::clone(&stats);
        a.session_opened();
        b.session_opened();
        a.fallback_started();

        assert_eq!(stats.sessions(), 2);
        assert_eq!(stats.fallbacks(), 1);
        assert_eq!(stats.tunnels(), 0);
    }

    #[test]
    fn test_user_octets_accumulate() {
        let stats = Stats::new();
        stats.tunnel_established("alice");
        stats.add_octets("alice", 100, 50);
        stats.add_octets("alice", 1, 2);

        assert_eq!(stats.tunnels(), 1);
        assert_eq!(stats.user_octets("alice"), 153);
        assert_eq!(stats.user_octets("nobody"), 0);
    }
}
