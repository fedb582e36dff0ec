//! Bounded, time-windowed record of recently handled messages.
//!
//! Slack may redeliver an event, and a mention inside a thread arrives both
//! as `app_mention` and as `message`. Both collapse onto the same message
//! key, so the second delivery is dropped while it is still in the window.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// In-memory dedup window.
pub struct RecentEvents {
    window: Duration,
    capacity: usize,
    inner: Mutex<RecentEventsInner>,
}

#[derive(Default)]
struct RecentEventsInner {
    order: VecDeque<(String, Instant)>,
    index: HashSet<String>,
}

impl RecentEventsInner {
    fn evict(&mut self, now: Instant, window: Duration, capacity: usize) {
        while let Some((key, seen_at)) = self.order.front() {
            let expired = now.saturating_duration_since(*seen_at) >= window;
            if !expired && self.order.len() <= capacity {
                break;
            }
            self.index.remove(key);
            self.order.pop_front();
        }
    }
}

impl RecentEvents {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity,
            inner: Mutex::new(RecentEventsInner::default()),
        }
    }

    /// Record `key`. Returns `false` if it was already seen inside the window.
    pub fn mark(&self, key: &str) -> bool {
        self.mark_at(key, Instant::now())
    }

    fn mark_at(&self, key: &str, now: Instant) -> bool {
        if self.capacity == 0 {
            return true;
        }

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.evict(now, self.window, self.capacity);

        if inner.index.contains(key) {
            return false;
        }
        inner.order.push_back((key.to_string(), now));
        inner.index.insert(key.to_string());
        inner.evict(now, self.window, self.capacity);
        true
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_inside_window_is_rejected() {
        let recent = RecentEvents::new(Duration::from_secs(60), 16);
        assert!(recent.mark("C1:1.0"));
        assert!(!recent.mark("C1:1.0"));
        assert!(recent.mark("C1:2.0"));
        assert_eq!(recent.len(), 2);
    }

    #[test]
    fn test_key_expires_after_window() {
        let recent = RecentEvents::new(Duration::from_secs(60), 16);
        let start = Instant::now();

        assert!(recent.mark_at("C1:1.0", start));
        assert!(!recent.mark_at("C1:1.0", start + Duration::from_secs(59)));
        assert!(recent.mark_at("C1:1.0", start + Duration::from_secs(61)));
    }

    #[test]
    fn test_capacity_bounds_memory() {
        let recent = RecentEvents::new(Duration::from_secs(600), 3);
        for i in 0..10 {
            assert!(recent.mark(&format!("C1:{}.0", i)));
        }
        assert_eq!(recent.len(), 3);
        // Oldest keys were evicted, newest are still tracked
        assert!(recent.mark("C1:0.0"));
        assert!(!recent.mark("C1:9.0"));
    }

    #[test]
    fn test_zero_capacity_disables_dedup() {
        let recent = RecentEvents::new(Duration::from_secs(600), 0);
        assert!(recent.mark("C1:1.0"));
        assert!(recent.mark("C1:1.0"));
        assert!(recent.is_empty());
    }
}
