use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Per-caller sliding one-minute window. Only admitted requests are recorded.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_and_record(&self, caller: &str, limit: u32) -> bool {
        self.check_and_record_at(caller, limit, Instant::now())
    }

    pub fn check_and_record_at(&self, caller: &str, limit: u32, now: Instant) -> bool {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows.entry(caller.to_string()).or_default();
        prune(window, now);
        if window.len() >= limit as usize {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Admitted requests per caller within the last minute.
    pub fn usage(&self) -> HashMap<String, usize> {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows.retain(|_, w| {
            prune(w, now);
            !w.is_empty()
        });
        windows.iter().map(|(k, w)| (k.clone(), w.len())).collect()
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant) {
    while let Some(&oldest) = window.front() {
        if now.saturating_duration_since(oldest) >= RATE_WINDOW {
            window.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_each_caller_independently() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();
        assert!(limiter.check_and_record_at("alice", 2, t0));
        assert!(limiter.check_and_record_at("alice", 2, t0));
        assert!(!limiter.check_and_record_at("alice", 2, t0));
        assert!(limiter.check_and_record_at("bob", 2, t0));
    }

    #[test]
    fn window_slides() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();
        assert!(limiter.check_and_record_at("alice", 1, t0));
        assert!(!limiter.check_and_record_at("alice", 1, t0 + Duration::from_secs(30)));
        assert!(limiter.check_and_record_at("alice", 1, t0 + Duration::from_secs(61)));
    }
}
