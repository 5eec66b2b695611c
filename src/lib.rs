pub mod capability;
pub mod cli;
pub mod commands;
pub mod compose;
pub mod config;
pub mod display;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod reconcile;
pub mod runner;
pub mod workspace;

use std::sync::Once;

pub const LOG_ENV: &str = "SIMDOCK_LOG";

static TRACING_INIT: Once = Once::new();

// Degradations are logged at warn, so that is the floor unless SIMDOCK_LOG says otherwise.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .with_env_filter(filter)
            .try_init();
    });
}
