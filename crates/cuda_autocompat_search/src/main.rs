//! `cuda-autocompat-search`: searches the configured libraries and paths for
//! the newest usable `libcuda.so.1` and prints the directory it lives in.
//!
//! The process exits successfully with that directory written to stdout (no
//! trailing newline, matching the original helper binary exactly, since the
//! audit interposer's shell wrapper captures this output verbatim) or exits
//! non-zero with nothing on stdout if no usable driver was found.

mod args;

use std::io::Write;
use std::process::ExitCode;

use cuda_autocompat_core::logging::{self, LogLevel};
use cuda_autocompat_core::search::{self, SearchState};
use cuda_autocompat_core::{log_error, log_info, log_warn};

const VERBOSE_ENV: &str = "CUDA_AUTOCOMPAT_VERBOSE";

fn init_logging() {
    logging::set_max_level(LogLevel::Warn);
    logging::set_log_name(format!("cuda_autocompat[{}]", std::process::id()));

    let tracing_filter = tracing_subscriber::EnvFilter::try_from_env("CUDA_AUTOCOMPAT_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_filter)
        .with_writer(std::io::stderr)
        .try_init();

    if let Ok(raw) = std::env::var(VERBOSE_ENV) {
        let mut chars = raw.chars();
        match (chars.next(), chars.next()) {
            (Some(digit), None) if digit.is_ascii_digit() => {
                let offset = digit as u8 - b'0';
                logging::set_max_level(LogLevel::from_verbose_offset(offset));
            }
            _ => {
                log_warn!("{VERBOSE_ENV} must be a single digit 0-6, ignoring '{raw}'");
            }
        }
    }
}

fn run() -> miette::Result<ExitCode> {
    init_logging();
    log_info!("cuda-autocompat-search {}", env!("CARGO_PKG_VERSION"));

    let argv: Vec<String> = std::env::args().collect();
    let (paths, libs) = match args::parse_args(&argv) {
        Ok(result) => result,
        Err(args::ParseArgsError::HelpRequested) => return Ok(ExitCode::FAILURE),
        Err(err) => return Err(miette::miette!("{err}")),
    };

    let mut state = SearchState::new();
    search::search(&libs, &paths, &mut state);

    match state.found {
        Some(found) => {
            log_info!(
                "Selected {} ({})",
                found.driver_dir.display(),
                found.version
            );
            print!("{}", found.driver_dir.display());
            std::io::stdout()
                .flush()
                .map_err(|e| miette::miette!("failed to flush stdout: {e}"))?;
            Ok(ExitCode::SUCCESS)
        }
        None => {
            log_error!("No usable libcuda.so.1 found");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn main() -> miette::Result<ExitCode> {
    run()
}
