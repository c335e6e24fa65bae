use std::io;
use std::path::PathBuf;

/// Unified error type covering all failure modes of the vigil watch pipeline.
///
/// Every variant carries an actionable message. The reconciliation worker
/// never dies on these: transient I/O failures are logged and the affected
/// path is re-enqueued, open failures route through the standard handler
/// (mark deleted or schedule a recrawl), and sync failures are surfaced to
/// the caller that requested the sync.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// Opening a directory for watching+reading failed.
    ///
    /// The `source` kind is meaningful: `NotFound`/`NotADirectory` means the
    /// directory is gone and is recorded as deleted; other kinds schedule a
    /// recrawl.
    #[error("failed to open {path} for watching: {source}")]
    Open {
        /// Directory that could not be opened.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// Enumerating a directory failed partway through.
    #[error("failed to read directory {path}: {source}. The path is re-queued for re-assessment.")]
    ReadDir {
        /// Directory being enumerated.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// A stat call on a single path failed for a reason other than the path
    /// being absent.
    #[error("failed to stat {path}: {source}")]
    Stat {
        /// Path that was statted.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// A sync did not complete within its budget.
    #[error(
        "sync timed out after {elapsed_ms}ms (budget: {budget_ms}ms). The view may still be catching up; retry with a larger timeout."
    )]
    SyncTimeout {
        /// How long the caller actually waited.
        elapsed_ms: u64,
        /// The caller-supplied budget.
        budget_ms: u64,
    },

    /// An in-flight sync was abandoned, typically because a recrawl
    /// invalidated every outstanding cookie.
    #[error("sync aborted: {reason}. Re-issue the sync; the view recreates its fence on retry.")]
    SyncAborted {
        /// Why the sync could not complete.
        reason: String,
    },

    /// The watch was stopped while an operation was in flight.
    #[error("watch cancelled during {phase}")]
    Cancelled {
        /// Which phase was active when the stop was observed.
        phase: &'static str,
    },

    /// A path handed to the query surface does not live under the watched
    /// root.
    #[error("{path} is outside the watched root {root}")]
    OutsideRoot {
        /// The offending path.
        path: PathBuf,
        /// The watched root.
        root: PathBuf,
    },

    /// A configuration value is invalid.
    #[error("invalid config: {field} = \"{value}\" — {reason}")]
    InvalidConfig {
        /// Which config field.
        field: &'static str,
        /// The invalid value.
        value: String,
        /// Why it is invalid.
        reason: &'static str,
    },

    /// Wraps `std::io::Error` for file operations with no more specific
    /// variant (cookie creation, worker spawn).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WatchError {
    /// The `io::ErrorKind` of the underlying system error, when there is
    /// one. Open-failure dispositions dispatch on this.
    #[must_use]
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Open { source, .. } | Self::ReadDir { source, .. } | Self::Stat { source, .. } => {
                Some(source.kind())
            }
            Self::Io(source) => Some(source.kind()),
            _ => None,
        }
    }

    /// Whether the underlying system error says the path no longer exists.
    ///
    /// `NotADirectory` counts: a parent component was replaced by a file,
    /// so the path as recorded is gone.
    #[must_use]
    pub fn is_gone(&self) -> bool {
        matches!(
            self.io_kind(),
            Some(io::ErrorKind::NotFound | io::ErrorKind::NotADirectory)
        )
    }
}

/// Convenience alias used throughout the vigil crate hierarchy.
pub type WatchResult<T> = Result<T, WatchError>;
