use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::Config;

/// Tracks active upstream connections per source index and answers cap and
/// priority queries for the load balancer.
pub struct ConcurrencyManager {
    config: Arc<Config>,
    counts: DashMap<String, Arc<AtomicUsize>>,
}

impl ConcurrencyManager {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            counts: DashMap::new(),
        }
    }

    fn counter(&self, index: &str) -> Arc<AtomicUsize> {
        self.counts
            .entry(index.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }

    /// True when the source is at or over its configured cap.
    pub fn check_concurrency(&self, index: &str) -> bool {
        self.current(index) >= self.config.max_concurrency(index)
    }

    /// Atomically adjust the active-connection count. Decrements clamp at 0.
    pub fn update_concurrency(&self, index: &str, increment: bool) {
        let counter = self.counter(index);
        if increment {
            counter.fetch_add(1, Ordering::SeqCst);
        } else {
            let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
        }
        log::debug!(
            "Active connections for source {}: {}",
            index,
            counter.load(Ordering::SeqCst)
        );
    }

    pub fn current(&self, index: &str) -> usize {
        self.counts
            .get(index)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Headroom of a source: cap minus active connections. Larger means the
    /// balancer should try this source earlier.
    pub fn priority_value(&self, index: &str) -> i64 {
        self.config.max_concurrency(index) as i64 - self.current(index) as i64
    }
}

/// Holds one active-connection slot for a source and releases it on drop, so
/// every writer exit path decrements exactly once.
pub struct ConnectionGuard {
    manager: Arc<ConcurrencyManager>,
    index: String,
}

impl ConnectionGuard {
    pub fn acquire(manager: Arc<ConcurrencyManager>, index: String) -> Self {
        manager.update_concurrency(&index, true);
        Self { manager, index }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.update_concurrency(&self.index, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_caps(caps: &[(&str, usize)]) -> ConcurrencyManager {
        let mut config = Config::default();
        for (index, cap) in caps {
            config.concurrency_caps.insert(index.to_string(), *cap);
        }
        ConcurrencyManager::new(Arc::new(config))
    }

    #[test]
    fn cap_check() {
        let cm = manager_with_caps(&[("0", 2)]);
        assert!(!cm.check_concurrency("0"));
        cm.update_concurrency("0", true);
        assert!(!cm.check_concurrency("0"));
        cm.update_concurrency("0", true);
        assert!(cm.check_concurrency("0"));
    }

    #[test]
    fn decrement_clamps_at_zero() {
        let cm = manager_with_caps(&[("0", 1)]);
        cm.update_concurrency("0", false);
        cm.update_concurrency("0", false);
        assert_eq!(cm.current("0"), 0);
    }

    #[test]
    fn priority_prefers_headroom() {
        let cm = manager_with_caps(&[("0", 2), ("1", 1)]);
        assert!(cm.priority_value("0") > cm.priority_value("1"));

        cm.update_concurrency("0", true);
        cm.update_concurrency("0", true);
        assert!(cm.priority_value("1") > cm.priority_value("0"));
    }

    #[test]
    fn guard_releases_on_drop() {
        let cm = Arc::new(manager_with_caps(&[("0", 1)]));
        {
            let _guard = ConnectionGuard::acquire(cm.clone(), "0".to_string());
            assert_eq!(cm.current("0"), 1);
        }
        assert_eq!(cm.current("0"), 0);
    }
}
