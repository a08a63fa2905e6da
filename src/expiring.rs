use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Membership with a per-entry time to live. Expired entries are evicted
/// lazily on lookup.
#[derive(Debug)]
pub struct ExpiringSet {
    max_age: Duration,
    entries: HashMap<String, Instant>,
}

impl ExpiringSet {
    #[must_use]
    pub fn new(max_age_seconds: u64) -> Self {
        Self {
            max_age: Duration::from_secs(max_age_seconds),
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: &str) {
        self.entries.insert(key.to_string(), Instant::now());
    }

    pub fn contains(&mut self, key: &str) -> bool {
        match self.entries.get(key) {
            None => false,
            Some(added) => {
                if added.elapsed() < self.max_age {
                    true
                } else {
                    self.entries.remove(key);
                    false
                }
            }
        }
    }
}
