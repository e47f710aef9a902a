use std::collections::HashMap;

const CONCURRENCY_PREFIX: &str = "M3U_MAX_CONCURRENCY_";

/// Runtime configuration, loaded once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Ring capacity of every shared stream buffer.
    pub buffer_chunks: usize,
    /// HLS idle timeout in seconds.
    pub timeout_seconds: u64,
    /// Load balancer lap budget. 0 means unbounded.
    pub max_retries: usize,
    /// Backoff floor in milliseconds.
    pub backoff_floor_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub backoff_ceiling_ms: u64,
    /// Idle TTL for client sessions in seconds.
    pub session_ttl_seconds: i64,
    pub load_balancing_mode: String,
    pub debug: bool,
    /// Per-source connection caps, keyed by source index.
    pub concurrency_caps: HashMap<String, usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_chunks: 30,
            timeout_seconds: 15,
            max_retries: 3,
            backoff_floor_ms: 200,
            backoff_ceiling_ms: 2000,
            session_ttl_seconds: 300,
            load_balancing_mode: String::new(),
            debug: false,
            concurrency_caps: HashMap::new(),
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let mut config = Config::default();

        if let Some(v) = parse_env::<usize>("BUFFER_CHUNKS") {
            if v > 0 {
                config.buffer_chunks = v;
            }
        }
        if let Some(v) = parse_env::<u64>("TIMEOUT_SECONDS") {
            config.timeout_seconds = v;
        }
        if let Some(v) = parse_env::<usize>("MAX_RETRIES") {
            config.max_retries = v;
        }
        config.load_balancing_mode = std::env::var("LOAD_BALANCING_MODE").unwrap_or_default();
        config.debug = std::env::var("DEBUG").map(|v| v == "true").unwrap_or(false);

        for (key, value) in std::env::vars() {
            if let Some(index) = key.strip_prefix(CONCURRENCY_PREFIX) {
                // Invalid values fall back to 1; an explicit 0 disables the
                // source.
                let cap = value.trim().parse::<usize>().unwrap_or(1);
                config.concurrency_caps.insert(index.to_string(), cap);
            }
        }

        config
    }

    /// Connection cap for a source. Absent or invalid entries default to 1.
    pub fn max_concurrency(&self, index: &str) -> usize {
        self.concurrency_caps.get(index).copied().unwrap_or(1)
    }

    /// Configured source indexes in preferred order.
    pub fn source_indexes(&self) -> Vec<String> {
        let mut indexes: Vec<String> = self.concurrency_caps.keys().cloned().collect();
        indexes.sort_by(crate::store::compare_indexes);
        indexes
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
