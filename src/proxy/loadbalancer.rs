use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::Config;
use crate::proxy::backoff::BackoffStrategy;
use crate::proxy::{BalancerResult, ProxyError};
use crate::store::concurrency::ConcurrencyManager;
use crate::store::session::Session;
use crate::store::{compare_indexes, IndexProvider, SlugParser, StreamInfo};

/// Picks a live upstream for a channel, honouring per-source concurrency
/// caps, the session's memory of already-failed pairs, and a lap-level
/// retry budget with exponential backoff between laps.
pub struct LoadBalancer {
    client: reqwest::Client,
    config: Arc<Config>,
    concurrency: Arc<ConcurrencyManager>,
    slug_parser: Arc<dyn SlugParser>,
    index_provider: Arc<dyn IndexProvider>,
}

impl LoadBalancer {
    pub fn new(
        client: reqwest::Client,
        config: Arc<Config>,
        concurrency: Arc<ConcurrencyManager>,
        slug_parser: Arc<dyn SlugParser>,
        index_provider: Arc<dyn IndexProvider>,
    ) -> Self {
        Self {
            client,
            config,
            concurrency,
            slug_parser,
            index_provider,
        }
    }

    pub async fn balance(
        &self,
        method: reqwest::Method,
        slug: &str,
        session: &Session,
        mut stop: watch::Receiver<bool>,
    ) -> Result<BalancerResult, ProxyError> {
        if slug.is_empty() {
            return Err(ProxyError::NotFound {
                slug: slug.to_string(),
            });
        }
        let info = self
            .slug_parser
            .get_stream_by_slug(slug)
            .map_err(|_| ProxyError::NotFound {
                slug: slug.to_string(),
            })?;
        if !info.has_urls() {
            return Err(ProxyError::NoUrls);
        }

        let mut backoff = BackoffStrategy::new(
            Duration::from_millis(self.config.backoff_floor_ms),
            Duration::from_millis(self.config.backoff_ceiling_ms),
        );

        let max_retries = self.config.max_retries;
        let mut lap = 0usize;
        loop {
            if max_retries > 0 && lap >= max_retries {
                break;
            }
            if *stop.borrow() {
                return Err(ProxyError::Cancelled);
            }
            log::debug!(
                "Stream attempt {} out of {} for session {}",
                lap + 1,
                max_retries,
                session.id
            );

            if let Some(result) = self.try_all_streams(&method, &info, session).await {
                return Ok(result);
            }

            // Give transient failures another chance next lap.
            session.clear_tested();

            let delay = backoff.next();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.wait_for(|stopped| *stopped) => {
                    return Err(ProxyError::Cancelled);
                }
            }
            lap += 1;
        }

        Err(ProxyError::Exhausted)
    }

    /// One lap: every source in priority order, every sub-URL in map order.
    async fn try_all_streams(
        &self,
        method: &reqwest::Method,
        info: &StreamInfo,
        session: &Session,
    ) -> Option<BalancerResult> {
        let mut indexes = self.index_provider.source_indexes();
        if indexes.is_empty() {
            indexes = info.urls.keys().cloned().collect();
        }
        indexes.sort_by(|a, b| {
            self.concurrency
                .priority_value(b)
                .cmp(&self.concurrency.priority_value(a))
                .then_with(|| compare_indexes(a, b))
        });

        for index in &indexes {
            let Some(inner) = info.urls.get(index) else {
                log::debug!("Channel not carried by source {}: {}", index, info.title);
                continue;
            };
            for (sub_index, url) in inner {
                if let Some(result) = self.try_single(method, session, index, sub_index, url).await
                {
                    return Some(result);
                }
            }
        }
        None
    }

    async fn try_single(
        &self,
        method: &reqwest::Method,
        session: &Session,
        index: &str,
        sub_index: &str,
        url: &str,
    ) -> Option<BalancerResult> {
        if session.contains(index, sub_index) {
            log::debug!("Skipping {index}|{sub_index}: already tested this lap");
            return None;
        }
        if self.concurrency.check_concurrency(index) {
            log::debug!("Concurrency limit reached for source {index}: {url}");
            return None;
        }

        let response = match self.client.request(method.clone(), url).send().await {
            Ok(response) => response,
            Err(e) => {
                log::error!("Error fetching stream {url}: {e}");
                session.mark_tested(index, sub_index);
                return None;
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            log::error!(
                "Non-200 status code received: {} for {} {}",
                response.status(),
                method,
                url
            );
            session.mark_tested(index, sub_index);
            return None;
        }

        log::debug!("Successfully fetched stream from {url} with method {method}");
        Some(BalancerResult {
            response,
            url: url.to_string(),
            index: index.to_string(),
            sub_index: sub_index.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{encode_slug, ConfigIndexProvider, DefaultSlugParser};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::collections::BTreeMap;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    /// Upstream that always answers with `status`, counting hits.
    async fn spawn_upstream(status: StatusCode) -> (SocketAddr, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/live",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (status, "BODY")
                }
            }),
        );
        (serve(router).await, hits)
    }

    /// Upstream that fails the first `failures` hits, then succeeds.
    async fn spawn_flaky_upstream(failures: usize) -> (SocketAddr, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/live",
            get(move || {
                let counter = counter.clone();
                async move {
                    let hit = counter.fetch_add(1, Ordering::SeqCst);
                    if hit < failures {
                        (StatusCode::INTERNAL_SERVER_ERROR, "")
                    } else {
                        (StatusCode::OK, "BODY")
                    }
                }
            }),
        );
        (serve(router).await, hits)
    }

    fn channel(urls: &[(&str, &str, String)]) -> StreamInfo {
        let mut map: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (index, sub, url) in urls {
            map.entry(index.to_string())
                .or_default()
                .insert(sub.to_string(), url.clone());
        }
        StreamInfo {
            title: "test channel".to_string(),
            urls: map,
            ..Default::default()
        }
    }

    fn balancer(config: Config) -> (LoadBalancer, Arc<ConcurrencyManager>) {
        let config = Arc::new(config);
        let concurrency = Arc::new(ConcurrencyManager::new(config.clone()));
        let lb = LoadBalancer::new(
            reqwest::Client::new(),
            config.clone(),
            concurrency.clone(),
            Arc::new(DefaultSlugParser),
            Arc::new(ConfigIndexProvider::new(config)),
        );
        (lb, concurrency)
    }

    fn stop_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    fn caps(entries: &[(&str, usize)]) -> Config {
        let mut config = Config::default();
        for (index, cap) in entries {
            config.concurrency_caps.insert(index.to_string(), *cap);
        }
        config
    }

    fn new_session() -> Arc<Session> {
        crate::store::session::SessionStore::new(300).get_or_create("test-client")
    }

    #[tokio::test]
    async fn unknown_slug_is_not_found() {
        let (lb, _) = balancer(caps(&[("0", 1)]));
        let session = new_session();
        let (_tx, rx) = stop_channel();
        let err = lb
            .balance(reqwest::Method::GET, "bogus", &session, rx)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NotFound { .. }));
    }

    #[tokio::test]
    async fn fails_over_to_next_source() {
        let (dead, dead_hits) = spawn_upstream(StatusCode::INTERNAL_SERVER_ERROR).await;
        let (live, live_hits) = spawn_upstream(StatusCode::OK).await;
        let info = channel(&[
            ("0", "a", format!("http://{dead}/live")),
            ("1", "a", format!("http://{live}/live")),
        ]);
        let slug = encode_slug(&info).unwrap();

        let (lb, _) = balancer(caps(&[("0", 1), ("1", 1)]));
        let session = new_session();
        let (_tx, rx) = stop_channel();

        let result = lb
            .balance(reqwest::Method::GET, &slug, &session, rx)
            .await
            .unwrap();
        assert_eq!(result.index, "1");
        assert_eq!(dead_hits.load(Ordering::SeqCst), 1);
        assert_eq!(live_hits.load(Ordering::SeqCst), 1);
        assert!(session.contains("0", "a"));
    }

    #[tokio::test]
    async fn priority_follows_headroom() {
        let (a, a_hits) = spawn_upstream(StatusCode::OK).await;
        let (b, b_hits) = spawn_upstream(StatusCode::OK).await;
        let info = channel(&[
            ("0", "a", format!("http://{a}/live")),
            ("1", "a", format!("http://{b}/live")),
        ]);
        let slug = encode_slug(&info).unwrap();

        // cap 2 vs cap 1, both idle: source 0 has more headroom.
        let (lb, cm) = balancer(caps(&[("0", 2), ("1", 1)]));
        let session = new_session();
        let (_tx, rx) = stop_channel();
        let result = lb
            .balance(reqwest::Method::GET, &slug, &session, rx)
            .await
            .unwrap();
        assert_eq!(result.index, "0");
        assert_eq!(a_hits.load(Ordering::SeqCst), 1);
        assert_eq!(b_hits.load(Ordering::SeqCst), 0);

        // Source 0 saturated: source 1 must win.
        cm.update_concurrency("0", true);
        cm.update_concurrency("0", true);
        let session = new_session();
        let (_tx, rx) = stop_channel();
        let result = lb
            .balance(reqwest::Method::GET, &slug, &session, rx)
            .await
            .unwrap();
        assert_eq!(result.index, "1");
        assert_eq!(a_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_pair_is_tried_twice_within_a_lap() {
        let (dead_a, hits_a) = spawn_upstream(StatusCode::NOT_FOUND).await;
        let (dead_b, hits_b) = spawn_upstream(StatusCode::NOT_FOUND).await;
        let info = channel(&[
            ("0", "a", format!("http://{dead_a}/live")),
            ("0", "b", format!("http://{dead_b}/live")),
        ]);
        let slug = encode_slug(&info).unwrap();

        let mut config = caps(&[("0", 1)]);
        config.max_retries = 1;
        let (lb, _) = balancer(config);
        let session = new_session();
        let (_tx, rx) = stop_channel();

        let err = lb
            .balance(reqwest::Method::GET, &slug, &session, rx)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Exhausted));
        assert_eq!(hits_a.load(Ordering::SeqCst), 1);
        assert_eq!(hits_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_on_second_lap_after_backoff() {
        let (flaky, hits) = spawn_flaky_upstream(1).await;
        let info = channel(&[("0", "a", format!("http://{flaky}/live"))]);
        let slug = encode_slug(&info).unwrap();

        let mut config = caps(&[("0", 1)]);
        config.max_retries = 3;
        let (lb, _) = balancer(config);
        let session = new_session();
        let (_tx, rx) = stop_channel();

        let started = std::time::Instant::now();
        let result = lb
            .balance(reqwest::Method::GET, &slug, &session, rx)
            .await
            .unwrap();
        assert_eq!(result.index, "0");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        // One backoff wait at the floor separates the two laps.
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_backoff_wait() {
        let (dead, _) = spawn_upstream(StatusCode::INTERNAL_SERVER_ERROR).await;
        let info = channel(&[("0", "a", format!("http://{dead}/live"))]);
        let slug = encode_slug(&info).unwrap();

        let mut config = caps(&[("0", 1)]);
        config.max_retries = 0; // unbounded
        let (lb, _) = balancer(config);
        let session = new_session();
        let (tx, rx) = stop_channel();

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
            tx
        });
        let err = lb
            .balance(reqwest::Method::GET, &slug, &session, rx)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Cancelled));
        let _tx = cancel.await.unwrap();
    }
}
