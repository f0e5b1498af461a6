//! Post-deployment health gates.
//!
//! Web-facing workloads are probed over HTTP with exponential backoff;
//! everything else just has to survive its first moments. Commands decide
//! which gate applies, health.rs only knows how to wait.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use backon::{ExponentialBuilder, Retryable};
use tracing::{debug, info};
use url::Url;

use crate::docker::DrayDocker;

/// Probe attempts before a deployment is declared unhealthy.
pub const DEFAULT_PROBE_ATTEMPTS: usize = 8;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const PROBE_MIN_DELAY: Duration = Duration::from_millis(250);
const RUNNING_GRACE: Duration = Duration::from_secs(2);

/// Build the local URL a published HTTP workload answers on.
pub fn local_http_url(port: u16, path: &str) -> Result<Url> {
    let base = Url::parse(&format!("http://localhost:{port}/"))
        .with_context(|| format!("Failed to build URL for port {port}"))?;
    base.join(path.trim_start_matches('/'))
        .with_context(|| format!("Failed to join path {path:?} onto {base}"))
}

/// Probe `url` until it answers a success status, with exponential backoff.
pub async fn probe_http(url: &Url, attempts: usize) -> Result<()> {
    let client = reqwest::Client::new();
    let probe = || async {
        client
            .get(url.clone())
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok::<_, reqwest::Error>(())
    };

    probe
        .retry(
            ExponentialBuilder::default()
                .with_min_delay(PROBE_MIN_DELAY)
                .with_max_times(attempts),
        )
        .notify(|err, delay| debug!("Health probe failed ({err}); retrying in {delay:?}"))
        .await
        .with_context(|| format!("{url} did not become healthy"))?;
    info!(url = %url, "Health probe succeeded");
    Ok(())
}

/// Give `container` a moment to crash on startup, then require it running.
pub async fn await_running(docker: &DrayDocker, container: &str) -> Result<()> {
    tokio::time::sleep(RUNNING_GRACE).await;
    if !docker.is_container_running(container).await? {
        bail!(
            "container {container} stopped right after starting; \
             check `docker logs {container}`"
        );
    }
    debug!(container, "Container is running");
    Ok(())
}
