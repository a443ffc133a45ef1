//! Per-token lease counters
//!
//! A counter records how many leases the current instance behind a token
//! has served. Counters reset whenever the instance is booted or killed.
//! The engine mirrors them into the device directory after every change.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct UsageTracker {
    counts: Mutex<HashMap<String, u32>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace every counter, as when restoring from the directory
    pub fn restore(&self, counts: HashMap<String, u32>) {
        *self.lock() = counts;
    }

    /// Copy of the non-zero counters
    pub fn counts(&self) -> HashMap<String, u32> {
        self.lock().clone()
    }

    pub fn reset(&self, token: &str) {
        self.lock().remove(token);
    }

    /// Count one more lease, returning the new total
    pub fn increment(&self, token: &str) -> u32 {
        let mut counts = self.lock();
        let count = counts.entry(token.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn get(&self, token: &str) -> u32 {
        self.lock().get(token).copied().unwrap_or(0)
    }

    /// Whether the instance served at least one lease and `limit` or more
    pub fn reached_limit(&self, token: &str, limit: u32) -> bool {
        let count = self.get(token);
        count > 0 && count >= limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_and_reset() {
        let usage = UsageTracker::new();
        assert_eq!(usage.get("5554"), 0);
        assert_eq!(usage.increment("5554"), 1);
        assert_eq!(usage.increment("5554"), 2);

        usage.reset("5554");
        assert_eq!(usage.get("5554"), 0);
        assert!(usage.counts().is_empty());
    }

    #[test]
    fn test_restore_replaces_counters() {
        let usage = UsageTracker::new();
        usage.increment("A");

        usage.restore(HashMap::from([("B".to_string(), 4)]));
        assert_eq!(usage.get("A"), 0);
        assert_eq!(usage.get("B"), 4);
        assert!(usage.reached_limit("B", 4));
    }

    #[test]
    fn test_reached_limit() {
        let usage = UsageTracker::new();
        assert!(!usage.reached_limit("A", 0));

        usage.increment("A");
        assert!(usage.reached_limit("A", 1));
        assert!(!usage.reached_limit("A", 2));

        usage.increment("A");
        assert!(usage.reached_limit("A", 2));
        assert!(!usage.reached_limit("B", 1));
    }
}
