use tokio::sync::watch;

use crate::proxy::coordinator::StreamCoordinator;
use crate::proxy::StreamStatus;

/// Relay an opaque byte stream (MPEG-TS, MP4, ...) from the upstream
/// response into the shared buffer until EOF, upstream failure, or
/// cancellation.
pub async fn run_opaque_writer(
    coordinator: &StreamCoordinator,
    mut response: reqwest::Response,
    mut stop: watch::Receiver<bool>,
) {
    coordinator.publish_headers(response.headers().clone());

    loop {
        tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => {
                log::debug!("Opaque writer for {} cancelled", coordinator.stream_id());
                coordinator.write_terminal(StreamStatus::ClientClosed);
                return;
            }
            chunk = response.chunk() => match chunk {
                Ok(Some(data)) => {
                    if !coordinator.write_chunk(data) {
                        // Coordinator left Active under us; whoever moved it
                        // has already published a terminal.
                        return;
                    }
                }
                Ok(None) => {
                    log::debug!("Upstream EOF for {}", coordinator.stream_id());
                    coordinator.write_terminal(StreamStatus::Eof);
                    return;
                }
                Err(e) => {
                    log::error!(
                        "Upstream read error for {}: {e}",
                        coordinator.stream_id()
                    );
                    coordinator.write_terminal(StreamStatus::ServerError);
                    return;
                }
            }
        }
    }
}
