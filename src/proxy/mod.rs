pub mod backoff;
pub mod buffer;
pub mod coordinator;
pub mod hls;
pub mod loadbalancer;
pub mod writer;

use thiserror::Error;

/// Terminal disposition of a stream, carried by the last chunk a writer
/// publishes into the shared buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// Upstream signalled a clean end of stream.
    Eof,
    /// Transport failure or unusable upstream response mid-stream.
    ServerError,
    /// Every client went away; the writer was cancelled.
    ClientClosed,
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("channel not found: {slug}")]
    NotFound { slug: String },
    #[error("channel has no stream urls configured")]
    NoUrls,
    #[error("exhausted all upstream sources")]
    Exhausted,
    #[error("load balancer cancelled")]
    Cancelled,
    #[error("master playlists are not supported")]
    MasterPlaylist,
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// A successful upstream pick: the live response plus the (source, sub)
/// pair that produced it. The response body is consumed by exactly one
/// writer, which also owns the concurrency slot for `index`.
#[derive(Debug)]
pub struct BalancerResult {
    pub response: reqwest::Response,
    pub url: String,
    pub index: String,
    pub sub_index: String,
}
