//! Common test utilities with tracing setup.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     // ... test code
//! }
//! ```
//!
//! # Configuration
//!
//! - `RUST_LOG`: filter directives (e.g. `circletree=debug,circletree::tree=trace`)
//! - `CIRCLETREE_LOG_CONSOLE`: set to "0" to silence console output
//!
//! The crate's own events only appear when it is built with
//! `--features tracing`.

#![allow(dead_code)]

use std::env;
use std::sync::Once;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Ensures tracing is only initialized once across all tests.
static INIT: Once = Once::new();

/// Initialize the tracing subscriber.
///
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    INIT.call_once(setup_tracing);
}

/// Create an `EnvFilter` from `RUST_LOG` or use the default level.
fn make_filter(default_level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("{default_level}")))
}

fn setup_tracing() {
    let console_enabled = !env::var("CIRCLETREE_LOG_CONSOLE").is_ok_and(|v| v == "0");

    let console_layer = console_enabled.then(|| {
        tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_target(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .compact()
            .with_filter(make_filter(Level::INFO))
    });

    // try_init: another test binary helper may already have installed one.
    let _ = Registry::default().with(console_layer).try_init();
}

/// Deterministic key permutation of `0..n` (`n` must not share a factor
/// with the stride).
pub fn shuffled(n: i64) -> impl Iterator<Item = i64> {
    (0..n).map(move |i| (i * 7919) % n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_init() {
        init_tracing();
        tracing::info!("Tracing initialized successfully");
        tracing::debug!(key = 42, "Debug event");
    }

    #[test]
    fn test_shuffled_is_a_permutation() {
        let mut keys: Vec<i64> = shuffled(1000).collect();
        keys.sort_unstable();
        assert_eq!(keys, (0..1000).collect::<Vec<_>>());
    }
}
