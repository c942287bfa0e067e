// src/main.rs

use clap::Parser;
use std::fs::create_dir_all;
use std::process::ExitCode;

use tracing::{debug, error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Registry};

use lpem::cli::{self, Cli};
use lpem::config::Config;

fn main() -> ExitCode {
    let cli_args = Cli::parse();
    let config = match Config::load(cli_args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::from(2);
        }
    };

    let _file_worker_guard = init_tracing(&config);

    info!("lpem starting up");
    debug!(config = ?config, "effective configuration");

    let code = cli::run(cli_args, &config);
    info!(exit_code = code, "lpem shutting down");

    ExitCode::from(code as u8)
}

/// Console layer on stderr plus a daily-rolling JSON file layer under
/// `logging.log_dir`, matching the teacher's two-layer `Registry` setup
/// (minus the TUI log-collector layer this tool has no TUI for).
fn init_tracing(config: &Config) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    create_dir_all(&config.logging.log_dir).ok();

    let file_appender = if config.logging.rotate_daily {
        rolling::daily(&config.logging.log_dir, "lpem.log")
    } else {
        rolling::never(&config.logging.log_dir, "lpem.log")
    };
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_writer)
        .with_ansi(false)
        .json();

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true);

    Registry::default()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    guard
}
