//! Filter statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter
#[derive(Debug)]
pub struct Counter {
    name: String,
    value: AtomicU64,
}

impl Counter {
    /// Counter starting at zero
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: AtomicU64::new(0),
        }
    }

    /// Fully qualified name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters shared by every filter built from one configuration
#[derive(Debug)]
pub struct FilterStats {
    /// Scripts that raised
    pub errors: Counter,
}

impl FilterStats {
    /// Stats named under `stat_prefix`
    pub fn new(stat_prefix: &str) -> Self {
        Self {
            errors: Counter::new(format!("{}script.errors", stat_prefix)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_name_and_value() {
        let stats = FilterStats::new("http.ingress.");
        assert_eq!(stats.errors.name(), "http.ingress.script.errors");
        stats.errors.inc();
        stats.errors.inc();
        assert_eq!(stats.errors.value(), 2);
    }
}
