//! Tree configuration and diagnostics.
//!
//! A [`TreeConfig`] is built with chained setters or read from the
//! environment:
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `CIRCLETREE_WRITE_LATENCY_NS` | busy-wait per flushed cache line |
//! | `CIRCLETREE_FINGERPRINTS` | `1`/`true` to keep leaf fingerprints |
//! | `CIRCLETREE_FLUSH_LOG` | `1`/`true` to record every flush |
//!
//! Operations that find nothing to do (deleting or updating an absent key)
//! report a [`Diagnostic`] to the configured callback instead of a global
//! stream.

use std::fmt as StdFmt;
use std::sync::Arc;

/// Upper bound accepted for the simulated write latency (1 ms per line).
pub const MAX_WRITE_LATENCY_NS: u64 = 1_000_000;

/// Environment variable holding the simulated write latency.
pub const ENV_WRITE_LATENCY: &str = "CIRCLETREE_WRITE_LATENCY_NS";

/// Environment variable enabling fingerprints.
pub const ENV_FINGERPRINTS: &str = "CIRCLETREE_FINGERPRINTS";

/// Environment variable enabling the flush log.
pub const ENV_FLUSH_LOG: &str = "CIRCLETREE_FLUSH_LOG";

// ============================================================================
//  Diagnostic
// ============================================================================

/// A non-fatal event reported to the diagnostics callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    /// `delete` found no entry for the key.
    DeleteMissing(i64),
    /// `update` found no entry for the key.
    UpdateMissing(i64),
}

impl StdFmt::Display for Diagnostic {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::DeleteMissing(key) => write!(f, "delete: key {key} not found"),
            Self::UpdateMissing(key) => write!(f, "update: key {key} not found"),
        }
    }
}

/// Diagnostics callback.
pub type DiagnosticSink = Arc<dyn Fn(&Diagnostic) + Send + Sync>;

// ============================================================================
//  ConfigError
// ============================================================================

/// Errors from building or loading a [`TreeConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Write latency above [`MAX_WRITE_LATENCY_NS`].
    InvalidLatency(u64),

    /// An environment variable did not parse.
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
}

impl StdFmt::Display for ConfigError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::InvalidLatency(ns) => write!(
                f,
                "write latency {ns}ns exceeds the {MAX_WRITE_LATENCY_NS}ns limit"
            ),

            Self::InvalidEnv { var, value } => write!(f, "invalid value {value:?} for {var}"),
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
//  TreeConfig
// ============================================================================

/// Per-tree settings.
#[derive(Clone, Default)]
pub struct TreeConfig {
    /// Busy-wait in nanoseconds per flushed cache line.
    pub write_latency_ns: u64,
    /// Keep one fingerprint byte per leaf entry.
    pub fingerprints: bool,
    /// Record every flush for inspection with `flush_log()`.
    pub flush_log: bool,
    /// Receives [`Diagnostic`]s. `None` drops them.
    pub diagnostics: Option<DiagnosticSink>,
}

impl TreeConfig {
    /// Default configuration: no latency, no fingerprints, no flush log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the simulated write latency.
    #[must_use]
    pub const fn write_latency_ns(mut self, ns: u64) -> Self {
        self.write_latency_ns = ns;
        self
    }

    /// Enable or disable leaf fingerprints.
    #[must_use]
    pub const fn fingerprints(mut self, enabled: bool) -> Self {
        self.fingerprints = enabled;
        self
    }

    /// Enable or disable the flush log.
    #[must_use]
    pub const fn flush_log(mut self, enabled: bool) -> Self {
        self.flush_log = enabled;
        self
    }

    /// Install a diagnostics callback.
    #[must_use]
    pub fn diagnostics<F>(mut self, sink: F) -> Self
    where
        F: Fn(&Diagnostic) + Send + Sync + 'static,
    {
        self.diagnostics = Some(Arc::new(sink));
        self
    }

    /// Read settings from the `CIRCLETREE_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    /// [`ConfigError::InvalidEnv`] if a variable is set but malformed, or
    /// [`ConfigError::InvalidLatency`] if the latency is too large.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// [`from_env`](Self::from_env) with an injectable variable source.
    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_WRITE_LATENCY) {
            config.write_latency_ns =
                raw.trim()
                    .parse::<u64>()
                    .map_err(|_| ConfigError::InvalidEnv {
                        var: ENV_WRITE_LATENCY,
                        value: raw.clone(),
                    })?;
        }
        if let Some(raw) = lookup(ENV_FINGERPRINTS) {
            config.fingerprints = parse_flag(ENV_FINGERPRINTS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_FLUSH_LOG) {
            config.flush_log = parse_flag(ENV_FLUSH_LOG, &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    /// [`ConfigError::InvalidLatency`] if the latency is too large.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.write_latency_ns > MAX_WRITE_LATENCY_NS {
            return Err(ConfigError::InvalidLatency(self.write_latency_ns));
        }
        Ok(())
    }

    pub(crate) fn report(&self, diagnostic: Diagnostic) {
        if let Some(sink) = &self.diagnostics {
            sink(&diagnostic);
        }
    }
}

fn parse_flag(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    let v = raw.trim();
    if v == "1" || v.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if v == "0" || v.eq_ignore_ascii_case("false") || v.is_empty() {
        Ok(false)
    } else {
        Err(ConfigError::InvalidEnv {
            var,
            value: raw.to_owned(),
        })
    }
}

impl StdFmt::Debug for TreeConfig {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("TreeConfig")
            .field("write_latency_ns", &self.write_latency_ns)
            .field("fingerprints", &self.fingerprints)
            .field("flush_log", &self.flush_log)
            .field("diagnostics", &self.diagnostics.is_some())
            .finish()
    }
}
