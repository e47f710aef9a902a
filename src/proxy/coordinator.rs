use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::proxy::buffer::{ReadOutcome, ReaderCursor, StreamBuffer};
use crate::proxy::loadbalancer::LoadBalancer;
use crate::proxy::{hls, writer, BalancerResult, ProxyError, StreamStatus};
use crate::store::concurrency::{ConcurrencyManager, ConnectionGuard};
use crate::store::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// No writer running.
    Idle,
    /// A writer owns an upstream fetch and is publishing chunks.
    Active,
    /// The writer has exited; the terminal chunk is still distributing.
    Draining,
    /// Process shutdown; no further activations.
    Closed,
}

/// Why a stream never produced response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartError {
    NotFound,
    Exhausted,
    Internal,
    /// The stream ended cleanly before any data was relayed.
    Eof,
}

/// One-shot response-header gate. Every reader observes the same snapshot,
/// or the same failure when the writer never got an upstream.
#[derive(Clone)]
pub enum HeaderGate {
    Pending,
    Ready(Arc<reqwest::header::HeaderMap>),
    Failed(StartError),
}

struct CoordinatorInner {
    state: CoordinatorState,
    /// Subscribed readers, including ones still waiting on the header gate.
    readers: usize,
    /// Readers that have not yet observed the terminal chunk. Only
    /// meaningful while draining.
    unobserved: usize,
    gate_tx: watch::Sender<HeaderGate>,
    stop_tx: watch::Sender<bool>,
    writer_task: Option<JoinHandle<()>>,
}

/// Per-channel singleton owning at most one upstream fetch and fanning its
/// chunks out to every concurrent client of that channel.
pub struct StreamCoordinator {
    stream_id: String,
    buffer: StreamBuffer,
    inner: Mutex<CoordinatorInner>,
}

impl StreamCoordinator {
    pub fn new(stream_id: String, buffer_chunks: usize) -> Arc<Self> {
        let (gate_tx, _) = watch::channel(HeaderGate::Pending);
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            stream_id,
            buffer: StreamBuffer::new(buffer_chunks),
            inner: Mutex::new(CoordinatorInner {
                state: CoordinatorState::Idle,
                readers: 0,
                unobserved: 0,
                gate_tx,
                stop_tx,
                writer_task: None,
            }),
        })
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn state(&self) -> CoordinatorState {
        self.inner.lock().unwrap().state
    }

    pub fn reader_count(&self) -> usize {
        self.inner.lock().unwrap().readers
    }

    /// Register a reader. The first request of an activation flips the
    /// coordinator to `Active` and is told to spawn the writer.
    pub fn subscribe(self: &Arc<Self>) -> Result<(ReaderHandle, bool), ProxyError> {
        let mut inner = self.inner.lock().unwrap();
        let becomes_writer = match inner.state {
            CoordinatorState::Closed => {
                return Err(ProxyError::Upstream("coordinator closed".to_string()))
            }
            CoordinatorState::Idle => {
                inner.state = CoordinatorState::Active;
                true
            }
            CoordinatorState::Active => false,
            CoordinatorState::Draining => {
                inner.unobserved += 1;
                false
            }
        };
        inner.readers += 1;
        let handle = ReaderHandle {
            coordinator: self.clone(),
            cursor: self.buffer.subscribe(),
            gate_rx: inner.gate_tx.subscribe(),
            observed_terminal: false,
        };
        Ok((handle, becomes_writer))
    }

    /// Launch the writer task for this activation: balance, then relay.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn_writer(
        self: &Arc<Self>,
        balancer: Arc<LoadBalancer>,
        client: reqwest::Client,
        config: Arc<Config>,
        concurrency: Arc<ConcurrencyManager>,
        method: reqwest::Method,
        slug: String,
        session: Arc<Session>,
    ) {
        let coordinator = self.clone();
        let stop_rx = self.stop_rx();
        let handle = tokio::spawn(async move {
            let lb_result = match balancer
                .balance(method, &slug, &session, stop_rx.clone())
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    log::warn!(
                        "Load balancing failed for {}: {e}",
                        coordinator.stream_id
                    );
                    let kind = match &e {
                        ProxyError::NotFound { .. } => StartError::NotFound,
                        ProxyError::Exhausted => StartError::Exhausted,
                        _ => StartError::Internal,
                    };
                    coordinator.fail_gate(kind);
                    coordinator.write_terminal(StreamStatus::ServerError);
                    return;
                }
            };

            log::info!(
                "Streaming {} from source {}|{} ({})",
                coordinator.stream_id,
                lb_result.index,
                lb_result.sub_index,
                lb_result.url
            );
            let _guard = ConnectionGuard::acquire(concurrency, lb_result.index.clone());
            if is_hls_stream(&lb_result) {
                hls::run_hls_writer(&coordinator, &client, lb_result, &config, stop_rx).await;
            } else {
                writer::run_opaque_writer(&coordinator, lb_result.response, stop_rx).await;
            }
        });
        self.inner.lock().unwrap().writer_task = Some(handle);
    }

    pub fn stop_rx(&self) -> watch::Receiver<bool> {
        self.inner.lock().unwrap().stop_tx.subscribe()
    }

    /// Publish a data chunk. Fails when the coordinator left `Active`.
    pub fn write_chunk(&self, data: Bytes) -> bool {
        {
            let inner = self.inner.lock().unwrap();
            if inner.state != CoordinatorState::Active {
                return false;
            }
        }
        self.buffer.write(data).is_some()
    }

    /// Publish the terminal chunk and move to `Draining`. Idempotent.
    pub fn write_terminal(&self, status: StreamStatus) {
        let mut inner = self.inner.lock().unwrap();
        if !self.buffer.write_terminal(status) {
            return;
        }
        // Readers still waiting on the header gate must not hang on a
        // stream that died before producing headers.
        if matches!(*inner.gate_tx.borrow(), HeaderGate::Pending) {
            let kind = match status {
                StreamStatus::Eof => StartError::Eof,
                _ => StartError::Internal,
            };
            let _ = inner.gate_tx.send(HeaderGate::Failed(kind));
        }
        if inner.state == CoordinatorState::Active {
            inner.state = CoordinatorState::Draining;
            inner.unobserved = inner.readers;
        }
        self.maybe_reset(&mut inner);
    }

    /// Publish the upstream response headers, minus `Content-Length`.
    /// Only the first call of an activation wins.
    pub fn publish_headers(&self, mut headers: reqwest::header::HeaderMap) -> bool {
        headers.remove(reqwest::header::CONTENT_LENGTH);
        let inner = self.inner.lock().unwrap();
        if !matches!(*inner.gate_tx.borrow(), HeaderGate::Pending) {
            return false;
        }
        let _ = inner.gate_tx.send(HeaderGate::Ready(Arc::new(headers)));
        true
    }

    fn fail_gate(&self, kind: StartError) {
        let inner = self.inner.lock().unwrap();
        if matches!(*inner.gate_tx.borrow(), HeaderGate::Pending) {
            let _ = inner.gate_tx.send(HeaderGate::Failed(kind));
        }
    }

    /// Process shutdown: cancel the writer and end every reader with a
    /// server-error terminal.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == CoordinatorState::Closed {
            return;
        }
        let _ = inner.stop_tx.send(true);
        if matches!(*inner.gate_tx.borrow(), HeaderGate::Pending) {
            let _ = inner.gate_tx.send(HeaderGate::Failed(StartError::Internal));
        }
        self.buffer.write_terminal(StreamStatus::ServerError);
        inner.state = CoordinatorState::Closed;
    }

    pub fn is_removable(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.readers == 0
            && matches!(
                inner.state,
                CoordinatorState::Idle | CoordinatorState::Closed
            )
    }

    fn reader_done(&self, observed_terminal: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.readers = inner.readers.saturating_sub(1);
        match inner.state {
            CoordinatorState::Active => {
                if inner.readers == 0 {
                    log::debug!("Last reader left {}, stopping writer", self.stream_id);
                    let _ = inner.stop_tx.send(true);
                }
            }
            CoordinatorState::Draining => {
                if !observed_terminal {
                    inner.unobserved = inner.unobserved.saturating_sub(1);
                }
                self.maybe_reset(&mut inner);
            }
            _ => {}
        }
    }

    fn note_terminal_observed(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == CoordinatorState::Draining {
            inner.unobserved = inner.unobserved.saturating_sub(1);
            self.maybe_reset(&mut inner);
        }
    }

    /// Once every reader has observed the terminal chunk the coordinator is
    /// ready for a fresh activation.
    fn maybe_reset(&self, inner: &mut CoordinatorInner) {
        if inner.state != CoordinatorState::Draining || inner.unobserved != 0 {
            return;
        }
        self.buffer.reset();
        let (gate_tx, _) = watch::channel(HeaderGate::Pending);
        let (stop_tx, _) = watch::channel(false);
        inner.gate_tx = gate_tx;
        inner.stop_tx = stop_tx;
        inner.writer_task = None;
        inner.state = CoordinatorState::Idle;
        log::debug!("Coordinator {} reset to idle", self.stream_id);
    }
}

/// A subscribed reader. Dropping it releases the subscription; when the
/// last reader of an active stream leaves, the writer is cancelled.
pub struct ReaderHandle {
    coordinator: Arc<StreamCoordinator>,
    cursor: ReaderCursor,
    gate_rx: watch::Receiver<HeaderGate>,
    observed_terminal: bool,
}

impl ReaderHandle {
    /// Wait for the writer to publish response headers or fail.
    pub async fn wait_headers(&mut self) -> HeaderGate {
        match self
            .gate_rx
            .wait_for(|gate| !matches!(gate, HeaderGate::Pending))
            .await
        {
            Ok(gate) => gate.clone(),
            Err(_) => HeaderGate::Failed(StartError::Internal),
        }
    }

    pub async fn read(&mut self) -> ReadOutcome {
        let outcome = self.coordinator.buffer.read(&mut self.cursor).await;
        if matches!(outcome, ReadOutcome::Terminal(_)) && !self.observed_terminal {
            self.observed_terminal = true;
            self.coordinator.note_terminal_observed();
        }
        outcome
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.coordinator.reader_done(self.observed_terminal);
    }
}

fn is_hls_stream(result: &BalancerResult) -> bool {
    let content_type = result
        .response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type.to_ascii_lowercase().contains("mpegurl") {
        return true;
    }
    url::Url::parse(&result.url)
        .map(|u| u.path().ends_with(".m3u8"))
        .unwrap_or(false)
}

/// Process-wide mapping of channel id to coordinator.
pub struct CoordinatorRegistry {
    coordinators: DashMap<String, Arc<StreamCoordinator>>,
    buffer_chunks: usize,
}

impl CoordinatorRegistry {
    pub fn new(buffer_chunks: usize) -> Self {
        Self {
            coordinators: DashMap::new(),
            buffer_chunks,
        }
    }

    pub fn get_or_create(&self, stream_id: &str) -> Arc<StreamCoordinator> {
        self.coordinators
            .entry(stream_id.to_string())
            .or_insert_with(|| StreamCoordinator::new(stream_id.to_string(), self.buffer_chunks))
            .clone()
    }

    /// Drop the coordinator once it has no readers and no writer.
    pub fn maybe_remove(&self, stream_id: &str) {
        self.coordinators
            .remove_if(stream_id, |_, coordinator| coordinator.is_removable());
    }

    pub fn shutdown(&self) {
        log::info!("Closing {} stream coordinators", self.coordinators.len());
        for entry in self.coordinators.iter() {
            entry.value().close();
        }
    }

    pub fn len(&self) -> usize {
        self.coordinators.len()
    }
}
