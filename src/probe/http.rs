//! HTTP probe implementation.

use std::time::{Duration, Instant};
use super::ProbeError;

/// Run an HTTP GET against the given URL.
///
/// Returns latency in milliseconds, measured to the last body byte.
pub async fn run_http_probe(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<f64, ProbeError> {
    let start = Instant::now();

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| classify(e, timeout))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ProbeError::Status(status.as_u16()));
    }

    // Read the full body to measure complete transfer time
    let _body = response
        .bytes()
        .await
        .map_err(|e| classify(e, timeout))?;

    Ok(start.elapsed().as_secs_f64() * 1000.0)
}

fn classify(err: reqwest::Error, timeout: Duration) -> ProbeError {
    if err.is_timeout() {
        ProbeError::Timeout(timeout)
    } else if err.is_connect() {
        ProbeError::Connection(err.to_string())
    } else {
        ProbeError::Request(err.to_string())
    }
}
