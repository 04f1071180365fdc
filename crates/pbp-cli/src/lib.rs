//! Shared pieces of the PBP command line tools

pub mod output;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Initialize env_logger. `RUST_LOG` wins; otherwise `--quiet` shows errors
/// only and `--verbose` adds debug output.
pub fn init_logging(verbose: bool, quiet: bool) {
    let level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Raise `cancel` on Ctrl-C. Returns false, after a warning, when the
/// handler cannot be installed and runs can no longer be interrupted cleanly.
pub fn install_cancel_handler(cancel: Arc<AtomicBool>) -> bool {
    let installed = ctrlc::set_handler(move || {
        log::warn!("Interrupt received, cancelling unfinished days");
        cancel.store(true, Ordering::SeqCst);
    });
    match installed {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Cannot install interrupt handler, runs cannot be cancelled: {}", e);
            false
        }
    }
}

/// Parse a `KEY=VALUE` argument
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}
