use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors this library may produce.
///
/// The engine records the first unrecoverable error as the connection's
/// *terminal* error and replays it to every pending and subsequent
/// operation, so the enum is `Clone` and carries rendered causes rather
/// than source errors.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Error {
    /// A match expression could not be parsed or compiled.
    #[error("bad match expression `{expression}`: {reason}")]
    Parse {
        /// The offending expression.
        expression: String,
        /// What was wrong with it.
        reason: String,
    },

    /// No port matched an expression which required one.
    #[error("no serial ports match `{expression}`")]
    NoMatch {
        /// The expression that matched nothing.
        expression: String,
    },

    /// More than one port matched where exactly one was required.
    #[error("multiple serial ports match `{expression}`: {}", .candidates.join(", "))]
    AmbiguousMatch {
        /// The expression that matched too much.
        expression: String,
        /// Device names of everything that matched.
        candidates: Vec<String>,
    },

    /// Locking refused the open under the current sharing mode.
    #[error("{device} is busy ({reason})")]
    SharingConflict {
        /// The contended device.
        device: String,
        /// Which locking step refused.
        reason: String,
    },

    /// A locking operation failed for an OS reason unrelated to sharing.
    #[error("{device}: can't lock ({reason})")]
    Locking {
        /// The device being locked.
        device: String,
        /// The OS-level cause.
        reason: String,
    },

    /// Invalid line parameters or an unknown sharing mode.
    #[error("bad configuration: {0}")]
    Configuration(String),

    /// Scanning the system for ports failed.
    #[error("can't scan serial ports: {0}")]
    Scan(String),

    /// A read or write on the OS handle failed after open.
    #[error("{device}: I/O error ({reason})")]
    Io {
        /// The device the handle belonged to.
        device: String,
        /// The OS-level cause.
        reason: String,
    },

    /// The device vanished (EOF or a gone-away errno).
    #[error("{device}: disconnected")]
    Disconnected {
        /// The device that went away.
        device: String,
    },

    /// A blocking operation exceeded its timeout.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The connection was terminated by `interrupt` or `close`.
    #[error("{device}: connection closed")]
    Interrupted {
        /// The closed device.
        device: String,
    },
}

impl Error {
    /// Whether retrying later could reasonably succeed.
    ///
    /// The tracker keeps polling through transient errors and surfaces
    /// fatal ones to its awaiters.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::NoMatch { .. }
                | Error::SharingConflict { .. }
                | Error::Disconnected { .. }
                | Error::Scan(_)
        )
    }

    /// Whether no amount of retrying will help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Parse { .. } | Error::Configuration(_))
    }
}
