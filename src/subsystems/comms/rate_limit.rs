//! Fixed-window event limiter for realtime connections.
//!
//! Each client gets a counter and a window start. When more than `window`
//! has passed since the start, the counter resets. Events past
//! `max_events` in one window are rejected, and the client is flagged
//! abusive once the count passes `max_events * abuse_multiplier`. Up to
//! twice the nominal rate can get through across a window boundary.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    /// Over the limit; drop this event.
    Limited,
    /// Far over the limit; drop the connection.
    Abusive,
}

#[derive(Debug, Clone, Copy)]
struct RateLimitEntry {
    count: u32,
    window_start: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    max_events: u32,
    window: Duration,
    abuse_threshold: u32,
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

impl RateLimiter {
    pub fn new(max_events: u32, window: Duration, abuse_multiplier: u32) -> Self {
        Self {
            max_events,
            window,
            abuse_threshold: max_events.saturating_mul(abuse_multiplier.max(1)),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Count one event from `client` at the current time.
    pub fn check(&self, client: &str) -> Verdict {
        self.check_at(client, Instant::now())
    }

    pub fn check_at(&self, client: &str, now: Instant) -> Verdict {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let entry = entries
            .entry(client.to_string())
            .or_insert(RateLimitEntry { count: 0, window_start: now });

        if now.saturating_duration_since(entry.window_start) > self.window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count = entry.count.saturating_add(1);

        if entry.count <= self.max_events {
            Verdict::Allowed
        } else if entry.count > self.abuse_threshold {
            Verdict::Abusive
        } else {
            Verdict::Limited
        }
    }

    /// Forget `client`; called on disconnect.
    pub fn remove(&self, client: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(client);
    }

    pub fn tracked_clients(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(5, Duration::from_millis(1000), 2)
    }

    #[test]
    fn threshold_admitted_next_rejected() {
        let rl = limiter();
        let t0 = Instant::now();
        for _ in 0..5 {
            assert_eq!(rl.check_at("c1", t0), Verdict::Allowed);
        }
        assert_eq!(rl.check_at("c1", t0), Verdict::Limited);
    }

    #[test]
    fn window_expiry_resets() {
        let rl = limiter();
        let t0 = Instant::now();
        for _ in 0..6 {
            rl.check_at("c1", t0);
        }
        // exactly one window later is still the same window
        assert_eq!(rl.check_at("c1", t0 + Duration::from_millis(1000)), Verdict::Limited);
        assert_eq!(rl.check_at("c1", t0 + Duration::from_millis(1001)), Verdict::Allowed);
    }

    #[test]
    fn clients_are_independent() {
        let rl = limiter();
        let t0 = Instant::now();
        for _ in 0..6 {
            rl.check_at("noisy", t0);
        }
        assert_eq!(rl.check_at("quiet", t0), Verdict::Allowed);
        assert_eq!(rl.tracked_clients(), 2);
    }

    #[test]
    fn abuse_past_multiplier() {
        let rl = limiter();
        let t0 = Instant::now();
        let verdicts: Vec<_> = (0..11).map(|_| rl.check_at("c1", t0)).collect();
        assert_eq!(verdicts[9], Verdict::Limited);
        assert_eq!(verdicts[10], Verdict::Abusive);
    }

    #[test]
    fn boundary_burst_admits_double() {
        let rl = limiter();
        let t0 = Instant::now();
        let late = t0 + Duration::from_millis(999);
        let next = t0 + Duration::from_millis(1001);
        let admitted = (0..5).filter(|_| rl.check_at("c1", late) == Verdict::Allowed).count()
            + (0..5).filter(|_| rl.check_at("c1", next) == Verdict::Allowed).count();
        // first check opened the window at `late`, so `next` is inside it
        assert_eq!(admitted, 5);

        let rl = limiter();
        rl.check_at("c2", t0);
        let burst = (0..4).filter(|_| rl.check_at("c2", late) == Verdict::Allowed).count()
            + (0..5).filter(|_| rl.check_at("c2", next) == Verdict::Allowed).count();
        assert_eq!(burst + 1, 10);
    }

    #[test]
    fn remove_forgets_client() {
        let rl = limiter();
        let t0 = Instant::now();
        for _ in 0..6 {
            rl.check_at("c1", t0);
        }
        rl.remove("c1");
        assert_eq!(rl.tracked_clients(), 0);
        assert_eq!(rl.check_at("c1", t0), Verdict::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_clock_window() {
        let rl = RateLimiter::new(2, Duration::from_secs(1), 3);
        assert_eq!(rl.check("c"), Verdict::Allowed);
        assert_eq!(rl.check("c"), Verdict::Allowed);
        assert_eq!(rl.check("c"), Verdict::Limited);
        tokio::time::advance(Duration::from_millis(1100)).await;
        assert_eq!(rl.check("c"), Verdict::Allowed);
    }
}
