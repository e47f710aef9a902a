use std::time::{Duration, Instant};

use m3u8_rs::Playlist;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use tokio::sync::watch;
use url::Url;

use crate::config::Config;
use crate::proxy::coordinator::StreamCoordinator;
use crate::proxy::{BalancerResult, ProxyError, StreamStatus};

/// Fallback when the manifest carries no usable target duration.
const DEFAULT_TARGET_DURATION: f64 = 2.0;
const MANIFEST_TIMEOUT: Duration = Duration::from_secs(10);
const SEGMENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Parsed view of a media playlist, with segment URIs already resolved
/// against the manifest URL.
#[derive(Debug)]
pub struct PlaylistMetadata {
    pub target_duration: f64,
    pub media_sequence: u64,
    pub version: Option<usize>,
    pub is_endlist: bool,
    pub segments: Vec<Url>,
}

pub fn parse_media_playlist(
    manifest_url: &Url,
    content: &[u8],
) -> Result<PlaylistMetadata, ProxyError> {
    match m3u8_rs::parse_playlist_res(content) {
        Ok(Playlist::MasterPlaylist(_)) => Err(ProxyError::MasterPlaylist),
        Ok(Playlist::MediaPlaylist(playlist)) => {
            let target_duration = if playlist.target_duration > 0 {
                playlist.target_duration as f64
            } else {
                DEFAULT_TARGET_DURATION
            };
            let mut segments = Vec::with_capacity(playlist.segments.len());
            for segment in &playlist.segments {
                match manifest_url.join(&segment.uri) {
                    Ok(url) => segments.push(url),
                    Err(e) => log::warn!("Invalid segment URL {:?}: {e}", segment.uri),
                }
            }
            Ok(PlaylistMetadata {
                target_duration,
                media_sequence: playlist.media_sequence,
                version: playlist.version,
                is_endlist: playlist.end_list,
                segments,
            })
        }
        Err(_) => Err(ProxyError::Upstream(
            "failed to parse media playlist".to_string(),
        )),
    }
}

/// Follow a live media playlist: poll it at roughly half the target
/// duration, stream every new segment into the shared buffer, and end the
/// stream on endlist, idle timeout, or cancellation.
pub async fn run_hls_writer(
    coordinator: &StreamCoordinator,
    client: &reqwest::Client,
    lb_result: BalancerResult,
    config: &Config,
    mut stop: watch::Receiver<bool>,
) {
    let manifest_url = match Url::parse(&lb_result.url) {
        Ok(url) => url,
        Err(e) => {
            log::error!("Invalid manifest URL {}: {e}", lb_result.url);
            coordinator.write_terminal(StreamStatus::ServerError);
            return;
        }
    };

    let idle_timeout = Duration::from_secs(config.timeout_seconds);
    let mut poll_interval = Duration::from_secs(1);
    let mut last_change = Instant::now();
    let mut last_media_seq: Option<u64> = None;
    let mut last_delivered: Option<u64> = None;
    // The balancer already fetched the manifest once; reuse that body for
    // the first lap, re-GET afterwards.
    let mut first_response = Some(lb_result.response);

    loop {
        if first_response.is_none() {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = stop.wait_for(|stopped| *stopped) => {
                    coordinator.write_terminal(StreamStatus::ClientClosed);
                    return;
                }
            }
        }

        if last_change.elapsed() > idle_timeout + poll_interval {
            log::warn!(
                "No new segments for {} within timeout, ending stream",
                coordinator.stream_id()
            );
            coordinator.write_terminal(StreamStatus::Eof);
            return;
        }

        let manifest = match fetch_manifest(client, &manifest_url, first_response.take()).await {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Manifest fetch failed for {manifest_url}: {e}");
                coordinator.write_terminal(StreamStatus::ServerError);
                return;
            }
        };

        let metadata = match parse_media_playlist(&manifest_url, &manifest) {
            Ok(metadata) => metadata,
            Err(e) => {
                log::error!("Unusable playlist from {manifest_url}: {e}");
                coordinator.write_terminal(StreamStatus::ServerError);
                return;
            }
        };

        // Poll at half the target duration, jittered ±10% so many channels
        // do not line up on the same upstream. Only adopt a new interval
        // when it differs by more than 10%.
        let target = metadata.target_duration / 2.0;
        let jittered = target * (0.9 + 0.2 * rand::random::<f64>());
        let candidate = Duration::from_secs_f64(jittered.max(0.1));
        if (candidate.as_secs_f64() - poll_interval.as_secs_f64()).abs()
            > poll_interval.as_secs_f64() * 0.1
        {
            log::debug!("Updated polling interval to {candidate:?}");
            poll_interval = candidate;
        }

        let advanced = last_media_seq.map_or(true, |seq| metadata.media_sequence >= seq);
        let strictly_advanced = last_media_seq.map_or(true, |seq| metadata.media_sequence > seq);
        if advanced {
            last_media_seq = Some(metadata.media_sequence);
            match process_segments(coordinator, client, &metadata, &mut last_delivered, &mut stop)
                .await
            {
                SegmentRun::Delivered(count) => {
                    if count > 0 || strictly_advanced {
                        last_change = Instant::now();
                    }
                }
                SegmentRun::Stopped => {
                    coordinator.write_terminal(StreamStatus::ClientClosed);
                    return;
                }
                SegmentRun::BufferClosed => return,
            }
        }

        if metadata.is_endlist {
            log::debug!("Endlist reached for {}", coordinator.stream_id());
            coordinator.write_terminal(StreamStatus::Eof);
            return;
        }
    }
}

async fn fetch_manifest(
    client: &reqwest::Client,
    url: &Url,
    live: Option<reqwest::Response>,
) -> Result<bytes::Bytes, ProxyError> {
    let response = match live {
        Some(response) => response,
        None => {
            let response = client
                .get(url.clone())
                .timeout(MANIFEST_TIMEOUT)
                .send()
                .await?;
            if response.status() != reqwest::StatusCode::OK {
                return Err(ProxyError::Upstream(format!(
                    "manifest status {}",
                    response.status()
                )));
            }
            response
        }
    };
    Ok(response.bytes().await?)
}

enum SegmentRun {
    /// All new segments handled; carries how many were actually streamed.
    Delivered(usize),
    Stopped,
    BufferClosed,
}

/// Stream every segment the playlist lists beyond the last delivered
/// sequence, in order, exactly once.
async fn process_segments(
    coordinator: &StreamCoordinator,
    client: &reqwest::Client,
    metadata: &PlaylistMetadata,
    last_delivered: &mut Option<u64>,
    stop: &mut watch::Receiver<bool>,
) -> SegmentRun {
    let mut delivered = 0usize;
    for (i, segment_url) in metadata.segments.iter().enumerate() {
        let segment_seq = metadata.media_sequence + i as u64;
        if last_delivered.is_some_and(|seq| segment_seq <= seq) {
            continue;
        }
        if *stop.borrow() {
            return SegmentRun::Stopped;
        }
        match stream_segment(coordinator, client, segment_url, stop).await {
            SegmentOutcome::Done => {
                delivered += 1;
                *last_delivered = Some(segment_seq);
            }
            SegmentOutcome::Skipped => {
                *last_delivered = Some(segment_seq);
            }
            SegmentOutcome::Stopped => return SegmentRun::Stopped,
            SegmentOutcome::BufferClosed => return SegmentRun::BufferClosed,
        }
    }
    SegmentRun::Delivered(delivered)
}

enum SegmentOutcome {
    Done,
    /// Unusable segment; warn and move on.
    Skipped,
    Stopped,
    BufferClosed,
}

async fn stream_segment(
    coordinator: &StreamCoordinator,
    client: &reqwest::Client,
    url: &Url,
    stop: &mut watch::Receiver<bool>,
) -> SegmentOutcome {
    let mut response = match client
        .get(url.clone())
        .timeout(SEGMENT_TIMEOUT)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            log::warn!("Error fetching segment {url}: {e}");
            return SegmentOutcome::Skipped;
        }
    };
    if response.status() != reqwest::StatusCode::OK {
        log::warn!(
            "Non-200 status code received: {} for {url}",
            response.status()
        );
        return SegmentOutcome::Skipped;
    }

    let mut headers = response.headers().clone();
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("video/MP2T"));
    }
    coordinator.publish_headers(headers);

    loop {
        tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => return SegmentOutcome::Stopped,
            chunk = response.chunk() => match chunk {
                Ok(Some(data)) => {
                    if !coordinator.write_chunk(data) {
                        return SegmentOutcome::BufferClosed;
                    }
                }
                Ok(None) => return SegmentOutcome::Done,
                Err(e) => {
                    log::warn!("Segment transfer error for {url}: {e}");
                    return SegmentOutcome::Skipped;
                }
            }
        }
    }
}
