use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;

/// Per-client attempt state. Tracks which (source, sub) pairs have already
/// been exhausted during the current balancer lap.
pub struct Session {
    pub id: String,
    tested: Mutex<HashSet<String>>,
    last_seen: AtomicI64,
}

fn pair_key(index: &str, sub_index: &str) -> String {
    format!("{index}|{sub_index}")
}

impl Session {
    fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tested: Mutex::new(HashSet::new()),
            last_seen: AtomicI64::new(chrono::Utc::now().timestamp()),
        }
    }

    pub fn contains(&self, index: &str, sub_index: &str) -> bool {
        self.tested.lock().unwrap().contains(&pair_key(index, sub_index))
    }

    pub fn mark_tested(&self, index: &str, sub_index: &str) {
        self.tested.lock().unwrap().insert(pair_key(index, sub_index));
    }

    /// Forget all tested pairs. Called between balancer laps so transient
    /// failures get another chance.
    pub fn clear_tested(&self) {
        self.tested.lock().unwrap().clear();
    }

    pub fn tested_count(&self) -> usize {
        self.tested.lock().unwrap().len()
    }

    fn touch(&self) {
        self.last_seen
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    fn idle_for(&self, now: i64) -> i64 {
        now - self.last_seen.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn backdate(&self, seconds: i64) {
        self.last_seen.fetch_sub(seconds, Ordering::Relaxed);
    }
}

/// In-memory session store keyed by client fingerprint. Idle sessions are
/// removed by a background sweeper.
pub struct SessionStore {
    sessions: DashMap<String, Arc<Session>>,
    ttl_seconds: i64,
}

impl SessionStore {
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl_seconds,
        }
    }

    pub fn get_or_create(&self, fingerprint: &str) -> Arc<Session> {
        let session = self
            .sessions
            .entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(Session::new()))
            .clone();
        session.touch();
        session
    }

    pub fn sweep(&self) {
        let now = chrono::Utc::now().timestamp();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| session.idle_for(now) < self.ttl_seconds);
        let removed = before - self.sessions.len();
        if removed > 0 {
            log::debug!("Swept {removed} idle sessions");
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                store.sweep();
            }
        })
    }
}
