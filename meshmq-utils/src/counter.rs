use std::fmt;
use std::sync::atomic::{AtomicIsize, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::json;

/// A gauge tracking the current value and the highest value it ever reached.
///
/// Used for broker-wide figures such as live connections, subscriptions or queued
/// session messages, where both the present load and the peak are of interest.
#[derive(Serialize, Deserialize, Default)]
pub struct Counter {
    count: AtomicIsize,
    max: AtomicIsize,
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        Counter::new_with(self.count(), self.max())
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, r#"{{ "count":{}, "max":{} }}"#, self.count(), self.max())
    }
}

impl Counter {
    #[inline]
    pub fn new() -> Self {
        Self::new_with(0, 0)
    }

    #[inline]
    pub fn new_with(count: isize, max: isize) -> Self {
        Counter { count: AtomicIsize::new(count), max: AtomicIsize::new(max) }
    }

    #[inline]
    pub fn inc(&self) {
        self.incs(1);
    }

    #[inline]
    pub fn incs(&self, c: isize) {
        let prev = self.count.fetch_add(c, Ordering::SeqCst);
        self.max.fetch_max(prev + c, Ordering::SeqCst);
    }

    #[inline]
    pub fn dec(&self) {
        self.decs(1)
    }

    #[inline]
    pub fn decs(&self, c: isize) {
        self.count.fetch_sub(c, Ordering::SeqCst);
    }

    /// Overwrites the current value, raising the peak if needed.
    #[inline]
    pub fn sets(&self, c: isize) {
        self.count.store(c, Ordering::SeqCst);
        self.max.fetch_max(c, Ordering::SeqCst);
    }

    #[inline]
    pub fn count(&self) -> isize {
        self.count.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn max(&self) -> isize {
        self.max.load(Ordering::SeqCst)
    }

    /// Folds another node's figures into this one.
    #[inline]
    pub fn add(&self, other: &Self) {
        self.count.fetch_add(other.count(), Ordering::SeqCst);
        self.max.fetch_add(other.max(), Ordering::SeqCst);
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "count": self.count(),
            "max": self.max()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_keeps_peak() {
        let c = Counter::new();
        c.inc();
        c.incs(4);
        c.decs(3);
        assert_eq!(c.count(), 2);
        assert_eq!(c.max(), 5);

        c.sets(1);
        assert_eq!(c.count(), 1);
        assert_eq!(c.max(), 5);

        let other = Counter::new_with(3, 7);
        c.add(&other);
        assert_eq!(c.count(), 4);
        assert_eq!(c.max(), 12);
        assert_eq!(c.to_json(), json!({"count": 4, "max": 12}));
    }
}
