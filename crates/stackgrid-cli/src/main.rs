use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "stackctl",
    about = "StackGrid — provision a single-service web stack",
    version,
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter stack.toml
    Init {
        /// Stack name
        #[arg(long)]
        name: String,
        /// Public domain record, e.g. app.example.com
        #[arg(long)]
        domain: String,
        /// Hosted zone that owns the domain
        #[arg(long)]
        zone: String,
        /// Where to write the file
        #[arg(short, long, default_value = "stack.toml")]
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Validate stack.toml without touching any backend
    Validate {
        #[arg(short, long, default_value = "stack.toml")]
        config: PathBuf,
    },
    /// Show the dependency waves of the topology
    Plan {
        #[arg(short, long, default_value = "stack.toml")]
        config: PathBuf,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Provision the stack against the simulated backend.
    ///
    /// State is persisted under --data-dir. The simulated backend lives
    /// for one invocation; use --repeat to re-apply against the same one.
    Apply {
        #[arg(short, long, default_value = "stack.toml")]
        config: PathBuf,
        /// Directory for the state store
        #[arg(long, default_value = ".stackgrid")]
        data_dir: PathBuf,
        /// Replace a certificate that failed validation
        #[arg(long)]
        reissue_certificate: bool,
        /// Number of applies to run against the same backend
        #[arg(long, default_value = "1")]
        repeat: u32,
        #[command(flatten)]
        sim: commands::apply::SimKnobs,
    },
    /// Show stored entities and apply runs
    Status {
        #[arg(long, default_value = ".stackgrid")]
        data_dir: PathBuf,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
        /// Include superseded and retired generations
        #[arg(long)]
        history: bool,
    },
    /// Simulate a rolling update and report the observed bounds
    Rollout {
        #[arg(short, long, default_value = "stack.toml")]
        config: PathBuf,
        /// Override the desired replica count
        #[arg(long)]
        desired: Option<u32>,
        /// New replicas never pass health checks
        #[arg(long)]
        unhealthy: bool,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Probe a running workload's health endpoint
    Probe {
        /// host:port of the workload
        #[arg(long, default_value = "127.0.0.1:3000")]
        address: String,
        #[arg(long, default_value = "/health")]
        path: String,
        /// Timeout in milliseconds
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,
    },
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

    match cli.command {
        Commands::Init {
            name,
            domain,
            zone,
            path,
            force,
        } => commands::init::init(&path, &name, &domain, &zone, force),
        Commands::Validate { config } => commands::validate::validate(&config),
        Commands::Plan { config, format } => commands::plan::plan(&config, &format),
        Commands::Apply {
            config,
            data_dir,
            reissue_certificate,
            repeat,
            sim,
        } => {
            commands::apply::apply(&config, &data_dir, reissue_certificate, repeat, &sim).await
        }
        Commands::Status {
            data_dir,
            format,
            history,
        } => commands::status::status(&data_dir, &format, history),
        Commands::Rollout {
            config,
            desired,
            unhealthy,
            format,
        } => commands::rollout::rollout(&config, desired, unhealthy, &format),
        Commands::Probe {
            address,
            path,
            timeout_ms,
        } => commands::probe::probe(&address, &path, timeout_ms).await,
    }
}
