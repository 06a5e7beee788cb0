//! Structured logging setup: a thin `tracing-subscriber` init driven by an
//! env filter. No terminal-styling layer — this crate has no interactive
//! CLI surface to colorize, just the thin demonstration binary.

use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Install a global `tracing` subscriber reading its filter directives from
/// `KEEPCACHE_LOG`, falling back to `info` for this crate and `warn`
/// everywhere else. Intended to be called once, near the start of `main`.
pub fn init() {
    let filter = EnvFilter::try_from_env("KEEPCACHE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("warn,keepcache=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}
