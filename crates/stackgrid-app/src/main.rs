//! hello-app — serve the hello workload.
//!
//! ```text
//! hello-app --port 3000
//! ```

use std::net::SocketAddr;

use clap::Parser;
use stackgrid_app::{DEFAULT_PORT, router};
use tracing::info;

#[derive(Parser)]
#[command(name = "hello-app", about = "StackGrid hello workload", version)]
struct Cli {
    /// Port to listen on. Falls back to $PORT, then 3000.
    #[arg(long)]
    port: Option<u16>,
}

fn resolve_port(flag: Option<u16>, env: Option<String>) -> anyhow::Result<u16> {
    if let Some(port) = flag {
        return Ok(port);
    }
    match env {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid PORT {raw:?}: {e}")),
        None => Ok(DEFAULT_PORT),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,stackgrid=debug")),
        )
        .init();

    let cli = Cli::parse();
    let port = resolve_port(cli.port, std::env::var("PORT").ok())?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "server started");

    axum::serve(listener, router())
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
            }
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_wins_over_env() {
        assert_eq!(resolve_port(Some(8080), Some("9090".to_string())).unwrap(), 8080);
        assert_eq!(resolve_port(None, Some("9090".to_string())).unwrap(), 9090);
        assert_eq!(resolve_port(None, None).unwrap(), DEFAULT_PORT);
        assert!(resolve_port(None, Some("http".to_string())).is_err());
    }
}
