//! minimemd binary — thin CLI shell over the [`minimem`] library crate.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use minimem::daemon::{self, DaemonOptions};
use minimem::machine::{home_state_dir, machine_id, GlobalConfig};
use minimem::validate::{validate_registry, Severity};

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Memory sync daemon — watches locally-mapped memory roots, autosyncs them
/// against the central repository, and validates the registry.
#[derive(Parser)]
#[command(name = "minimemd", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Seconds between central-repo polls
    #[arg(long, default_value_t = 30)]
    poll_interval: u64,

    /// Seconds between registry validation passes
    #[arg(long, default_value_t = 300)]
    validation_interval: u64,

    /// Append logs to ~/.minimem/daemon.log instead of stderr
    #[arg(long)]
    log_file: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the central-repo registry and exit non-zero on errors
    Validate {
        /// Central repository path (default: from the global config)
        #[arg(long)]
        central: Option<PathBuf>,
    },
}

fn init_logging(to_file: bool) {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("minimem=info".parse().expect("static directive parses"));
    if to_file {
        let log_path = home_state_dir().join("daemon.log");
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match std::fs::OpenOptions::new().create(true).append(true).open(&log_path) {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .init();
                return;
            }
            Err(e) => eprintln!("could not open {}: {e}; logging to stderr", log_path.display()),
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn run_validate(central: Option<PathBuf>) -> i32 {
    let central = match central {
        Some(path) => path,
        None => match GlobalConfig::load().map(|c| c.central_repo) {
            Ok(Some(path)) => path,
            Ok(None) => {
                eprintln!("no central repo configured; pass --central or set it in the global config");
                return 2;
            }
            Err(e) => {
                eprintln!("could not read global config: {e}");
                return 2;
            }
        },
    };
    let machine = match machine_id() {
        Ok(id) => id,
        Err(e) => {
            eprintln!("could not determine machine id: {e}");
            return 2;
        }
    };
    match validate_registry(&central, &machine) {
        Ok(report) => {
            println!(
                "mappings: {} total, {} active, {} stale, {} collisions, {} missing",
                report.stats.total,
                report.stats.active,
                report.stats.stale,
                report.stats.collisions,
                report.stats.missing
            );
            for issue in &report.issues {
                let label = match issue.severity {
                    Severity::Error => "error",
                    Severity::Warning => "warning",
                };
                eprintln!("{label}: {} {}", issue.central_path, issue.detail);
            }
            if report.is_valid() {
                0
            } else {
                1
            }
        }
        Err(e) => {
            eprintln!("validation failed: {e}");
            2
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Some(Commands::Validate { central }) = cli.command {
        std::process::exit(run_validate(central));
    }

    init_logging(cli.log_file);

    let options = DaemonOptions {
        poll_interval: Duration::from_secs(cli.poll_interval.max(1)),
        validation_interval: Duration::from_secs(cli.validation_interval.max(1)),
        ..DaemonOptions::default()
    };
    info!(
        poll_s = options.poll_interval.as_secs(),
        validation_s = options.validation_interval.as_secs(),
        "starting minimem daemon"
    );
    if let Err(e) = daemon::run(options).await {
        error!(error = %e, "daemon exited with error");
        std::process::exit(1);
    }
}
