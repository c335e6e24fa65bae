//! Tracing conventions for vigil.
//!
//! Consumers bring their own subscriber; this module only fixes the target
//! prefix, the standard span and field names, and a level parser keyed on
//! `VIGIL_LOG_LEVEL`, so logs stay filterable and greppable across crates.

use tracing::Level;

/// Target prefix used by all vigil tracing spans and events.
///
/// Filter with `RUST_LOG=vigil=debug`.
pub const TARGET_PREFIX: &str = "vigil";

/// Standard span names used across the reconciliation pipeline.
pub mod span_names {
    /// One full (re)crawl of a root.
    pub const FULL_CRAWL: &str = "vigil::full_crawl";
    /// One drain of the pending working set.
    pub const RECONCILE: &str = "vigil::reconcile";
    /// Settle handling after a quiet period.
    pub const SETTLE: &str = "vigil::settle";
    /// A client-initiated cookie sync.
    pub const SYNC: &str = "vigil::sync";
}

/// Standard structured field names used in tracing events.
pub mod field_names {
    pub const PATH: &str = "path";
    pub const PENDING_COUNT: &str = "pending_count";
    pub const TICK: &str = "tick";
    pub const RECRAWL_COUNT: &str = "recrawl_count";
    pub const DURATION_US: &str = "duration_us";
}

/// Parse a log level string (case-insensitive).
#[must_use]
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Recommended level for the current environment: `VIGIL_LOG_LEVEL` when set
/// and recognized, else the provided default.
#[must_use]
pub fn level_from_env(default: Level) -> Level {
    std::env::var("VIGIL_LOG_LEVEL")
        .ok()
        .and_then(|s| parse_level(&s))
        .unwrap_or(default)
}
