//! Tracing subscriber setup for the daemon.
//!
//! - ERROR: a worker or the control loop cannot continue
//! - WARN: rejected input, checksum mismatches, dropped commands
//! - INFO: admin state transitions, route installs, adjacency changes
//! - DEBUG: LSDB, graph and SPF internals

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Installs the global subscriber. `RUST_LOG` overrides the default `info` level.
pub fn init(format: LogFormat) {
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(env_filter("info")).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter("info"))
            .init(),
    }
}

/// Subscriber for tests; safe to call from every test.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter("debug"))
        .with_test_writer()
        .try_init();
}
