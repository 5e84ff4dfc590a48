//! Retry policy for gateway HTTP calls: transient transport errors and 5xx responses are retried
//! with linearly increasing backoff; everything else is returned to the caller as-is.

use bytes::Bytes;
use reqwest::{RequestBuilder, StatusCode};
use std::error::Error as _;
use std::io::ErrorKind;
use std::time::Duration;

/// Retry cap and linear backoff step (attempt n waits `backoff * n`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff * attempt
    }
}

/// Status and fully-read body of one HTTP exchange.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl RawResponse {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

const TRANSIENT_MARKERS: [&str; 6] = [
    "connection reset",
    "connection refused",
    "broken pipe",
    "unexpected eof",
    "unexpected end of file",
    "connection closed before message completed",
];

/// Timeouts, resets, refused connections, broken pipes and truncated streams.
pub fn is_transient(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_connect() {
        return true;
    }
    let mut chain = err.to_string().to_lowercase();
    let mut source = err.source();
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                ErrorKind::TimedOut
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        chain.push_str(": ");
        chain.push_str(&e.to_string().to_lowercase());
        source = e.source();
    }
    TRANSIENT_MARKERS.iter().any(|m| chain.contains(m))
}

async fn exchange(request: RequestBuilder) -> Result<RawResponse, reqwest::Error> {
    let res = request.send().await?;
    let status = res.status();
    let body = res.bytes().await?;
    Ok(RawResponse { status, body })
}

/// Send the request built by `build` under `policy`. 4xx and exhausted 5xx responses are returned
/// as `Ok`; only non-transient or exhausted transport errors are `Err`.
pub async fn send_with_retry<F>(
    policy: &RetryPolicy,
    label: &str,
    mut build: F,
) -> Result<RawResponse, reqwest::Error>
where
    F: FnMut() -> RequestBuilder,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let can_retry = attempt <= policy.max_retries;
        match exchange(build()).await {
            Ok(res) if res.status.is_server_error() && can_retry => {
                let wait = policy.delay_for(attempt);
                log::debug!(
                    "{}: attempt {} got {}, retrying in {:?}",
                    label,
                    attempt,
                    res.status,
                    wait
                );
                tokio::time::sleep(wait).await;
            }
            Ok(res) => return Ok(res),
            Err(e) if can_retry && is_transient(&e) => {
                let wait = policy.delay_for(attempt);
                log::debug!(
                    "{}: attempt {} transport error ({}), retrying in {:?}",
                    label,
                    attempt,
                    e,
                    wait
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}
