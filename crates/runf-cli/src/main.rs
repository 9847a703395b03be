//! # runf
//!
//! Runs one command in a fresh, isolated container and exits with its
//! status. The same binary is re-executed as `runf init` to become the
//! container's init process.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

mod commands;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::commands::{Cli, LogFormat};

/// Filter used when `RUST_LOG` is unset. Container output shares the
/// terminal, so only problems are reported by default.
const DEFAULT_LOG_FILTER: &str = "warn";

fn main() -> ExitCode {
    run_init_if_requested();

    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match commands::execute(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "runf failed");
            #[allow(clippy::print_stderr)]
            {
                eprintln!("runf: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}

/// Turns this process into a container's init when invoked as `runf init`.
/// Must run before anything else so the process is still single-threaded.
#[cfg(target_os = "linux")]
fn run_init_if_requested() {
    if runf_runtime::is_init_invocation() {
        init_tracing(LogFormat::Text);
        runf_runtime::start_initialization(&runf_core::provider::LinuxProvider::new());
    }
}

#[cfg(not(target_os = "linux"))]
const fn run_init_if_requested() {}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
