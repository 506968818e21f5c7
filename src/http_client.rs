use std::time::Duration;

use crate::error::Result as AppResult;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Client for non-streaming upstream calls; `timeout` bounds the whole attempt.
pub fn timeout_client(timeout: Duration) -> AppResult<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(timeout)
        .build()?)
}

/// Client for SSE relays: no total timeout, long-lived connections kept warm.
pub fn streaming_client() -> AppResult<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_keepalive(Duration::from_secs(30))
        .pool_idle_timeout(Duration::from_secs(90))
        .build()?)
}
