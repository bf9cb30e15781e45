use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use lockguardd::{exit_codes, GuardConfig};

#[derive(Debug, Parser)]
#[command(
    name = "lockguardd",
    about = "Privileged screen-lock transition guard",
    version
)]
struct Cli {
    /// Path to a TOML policy file; built-in defaults apply without one.
    #[arg(long, value_name = "FILE")]
    config: Option<std::path::PathBuf>,

    /// Log filter directives (RUST_LOG takes precedence).
    #[arg(long, default_value = "lockguardd=info")]
    log_filter: String,
}

fn init_tracing(fallback: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_filter);

    let config = match GuardConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::from(exit_codes::codes::CONFIG_ERROR);
        }
    };

    match lockguardd::run_guard(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(fatal) => {
            error!(error = %fatal, "fatal startup failure");
            ExitCode::from(exit_codes::for_fatal(&fatal))
        }
    }
}
