use std::time::Duration;

use axum::http::HeaderMap;

/// Build the process-wide upstream HTTP client.
///
/// Streaming responses must stay open indefinitely, so only the connect
/// phase carries a deadline here; manifest and segment requests add their
/// own per-request timeouts.
pub fn build_http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .build()
}

/// Stable fingerprint for a client, used to key the session store.
///
/// Prefers `X-Forwarded-For` over the socket peer address so clients behind
/// a reverse proxy keep one session.
pub fn client_fingerprint(remote_addr: &str, headers: &HeaderMap, debug: bool) -> String {
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(remote_addr);
    let user_agent = header_str(headers, "user-agent");
    let accept = header_str(headers, "accept");
    let accept_lang = header_str(headers, "accept-language");

    let data = format!("{ip}|{user_agent}|{accept}|{accept_lang}");
    if debug {
        log::debug!("Generating fingerprint from: {data}");
    }
    format!("{:x}", md5::compute(data))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}
