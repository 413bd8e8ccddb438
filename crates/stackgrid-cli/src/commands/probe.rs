//! `stackctl probe` — one HTTP health probe against a running workload.

use std::time::Duration;

use anyhow::{Result, bail};
use stackgrid_health::{ProbeResult, http_probe};
use tracing::debug;

pub async fn probe(address: &str, path: &str, timeout_ms: u64) -> Result<()> {
    let result = check(address, path, Duration::from_millis(timeout_ms)).await;
    match result {
        ProbeResult::Healthy => {
            println!("{address}{path}: healthy");
            Ok(())
        }
        ProbeResult::Unhealthy => bail!("{address}{path}: unhealthy"),
        ProbeResult::Failed => bail!("{address}{path}: unreachable"),
    }
}

async fn check(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let result = http_probe(address, path, timeout).await;
    debug!(%address, %path, ?result, "probe finished");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn serve_hello() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, stackgrid_app::router()).await.unwrap();
        });
        address
    }

    #[tokio::test]
    async fn running_workload_is_healthy() {
        let address = serve_hello().await;
        assert_eq!(
            check(&address, "/health", Duration::from_secs(2)).await,
            ProbeResult::Healthy
        );
        assert!(probe(&address, "/health", 2000).await.is_ok());
    }

    #[tokio::test]
    async fn missing_path_is_unhealthy() {
        let address = serve_hello().await;
        assert_eq!(
            check(&address, "/nope", Duration::from_secs(2)).await,
            ProbeResult::Unhealthy
        );
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(probe(&address, "/health", 500).await.is_err());
    }
}
