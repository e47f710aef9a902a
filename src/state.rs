use std::sync::Arc;

use crate::config::Config;
use crate::proxy::coordinator::CoordinatorRegistry;
use crate::proxy::loadbalancer::LoadBalancer;
use crate::store::concurrency::ConcurrencyManager;
use crate::store::session::SessionStore;
use crate::store::{ConfigIndexProvider, DefaultSlugParser};

/// Process-wide services, cloned into every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub client: reqwest::Client,
    pub sessions: Arc<SessionStore>,
    pub concurrency: Arc<ConcurrencyManager>,
    pub registry: Arc<CoordinatorRegistry>,
    pub balancer: Arc<LoadBalancer>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, reqwest::Error> {
        let config = Arc::new(config);
        let client = crate::utils::build_http_client()?;
        let concurrency = Arc::new(ConcurrencyManager::new(config.clone()));
        let balancer = Arc::new(LoadBalancer::new(
            client.clone(),
            config.clone(),
            concurrency.clone(),
            Arc::new(DefaultSlugParser),
            Arc::new(ConfigIndexProvider::new(config.clone())),
        ));
        Ok(Self {
            sessions: Arc::new(SessionStore::new(config.session_ttl_seconds)),
            registry: Arc::new(CoordinatorRegistry::new(config.buffer_chunks)),
            config,
            client,
            concurrency,
            balancer,
        })
    }
}
