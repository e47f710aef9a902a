use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};

use crate::proxy::buffer::ReadOutcome;
use crate::proxy::coordinator::{HeaderGate, ReaderHandle, StartError};
use crate::state::AppState;
use crate::utils::client_fingerprint;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    Router::new()
        .route("/stream/*path", get(stream_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve one channel. The slug (extension stripped) identifies the channel;
/// the first concurrent request becomes the writer, everyone else reads
/// from the shared buffer.
async fn stream_handler(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(path): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let slug = path
        .rsplit('/')
        .next()
        .unwrap_or("")
        .split('.')
        .next()
        .unwrap_or("")
        .to_string();
    if slug.is_empty() {
        return StatusCode::NOT_FOUND.into_response();
    }
    log::debug!("Request from {remote} for channel slug {slug}");

    let fingerprint = client_fingerprint(&remote.to_string(), &headers, state.config.debug);
    let session = state.sessions.get_or_create(&fingerprint);

    let coordinator = state.registry.get_or_create(&slug);
    let (mut reader, becomes_writer) = match coordinator.subscribe() {
        Ok(pair) => pair,
        Err(e) => {
            log::warn!("Cannot join stream {slug}: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if becomes_writer {
        let upstream_method = if method == Method::HEAD {
            reqwest::Method::HEAD
        } else {
            reqwest::Method::GET
        };
        coordinator.spawn_writer(
            state.balancer.clone(),
            state.client.clone(),
            state.config.clone(),
            state.concurrency.clone(),
            upstream_method,
            slug.clone(),
            session,
        );
    }

    match reader.wait_headers().await {
        HeaderGate::Ready(upstream_headers) => {
            let (tx, rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes, std::io::Error>>(16);
            let registry = state.registry.clone();
            let stream_id = slug.clone();
            tokio::spawn(async move {
                relay_chunks(reader, tx).await;
                registry.maybe_remove(&stream_id);
            });

            let mut builder = Response::builder().status(StatusCode::OK);
            for (name, value) in upstream_headers.iter() {
                if let Ok(value) = HeaderValue::from_bytes(value.as_bytes()) {
                    builder = builder.header(name.as_str(), value);
                }
            }
            builder
                .body(Body::from_stream(ReceiverStream::new(rx)))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        HeaderGate::Failed(kind) => {
            drop(reader);
            state.registry.maybe_remove(&slug);
            match kind {
                StartError::NotFound => StatusCode::NOT_FOUND.into_response(),
                StartError::Exhausted => StatusCode::BAD_GATEWAY.into_response(),
                StartError::Internal => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
                // The stream ended cleanly before producing any data.
                StartError::Eof => StatusCode::OK.into_response(),
            }
        }
        HeaderGate::Pending => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Pump buffer chunks into the client response until the stream terminates
/// or the client goes away.
async fn relay_chunks(
    mut reader: ReaderHandle,
    tx: tokio::sync::mpsc::Sender<Result<bytes::Bytes, std::io::Error>>,
) {
    loop {
        tokio::select! {
            outcome = reader.read() => match outcome {
                ReadOutcome::Chunk(chunk) => {
                    if tx.send(Ok(chunk.data.clone())).await.is_err() {
                        log::debug!("Client disconnected mid-stream");
                        break;
                    }
                }
                ReadOutcome::Terminal(status) => {
                    log::debug!("Stream terminal: {status:?}");
                    break;
                }
            },
            _ = tx.closed() => {
                log::debug!("Client disconnected mid-stream");
                break;
            }
        }
    }
}
