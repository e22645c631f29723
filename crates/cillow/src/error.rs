//! Error taxonomy for the cillow service.
//!
//! Two layers of errors exist:
//! - [`Exception`] — the user-visible failure payload carried by an
//!   `exception` response frame. These travel *as data* back to the client;
//!   the broker never closes a connection because of one.
//! - [`CillowError`] — infrastructure failures (I/O, framing, serialization)
//!   internal to the service. These terminate at most the affected channel.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The wire-level `type` discriminator of an exception frame.
///
/// Serialized with the variant name verbatim, e.g. `"UserCodeError"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Raised by `run_code` evaluation; message carries the original Python
    /// exception type name, and the traceback field the formatted traceback.
    UserCodeError,
    /// The package installer exited with a non-zero status.
    InstallerError,
    /// `run_command` could not be spawned.
    CommandError,
    /// The client already holds its maximum number of interpreters.
    PerClientQuotaExceeded,
    /// The pool already holds the global maximum number of interpreters.
    GlobalQuotaExceeded,
    /// The request queue is full; the broker refused without blocking.
    ServerBusy,
    /// An operation referenced an environment with no pooled worker.
    UnknownEnvironment,
    /// The worker subprocess failed to spawn or to report ready in time.
    WorkerStartupFailed,
    /// The worker subprocess exited mid-request.
    WorkerDied,
    /// The request was abandoned by interpreter deletion or client disconnect.
    Cancelled,
    /// The broker is shutting down.
    Shutdown,
    /// The request payload could not be parsed.
    MalformedRequest,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::UserCodeError => "UserCodeError",
            ErrorKind::InstallerError => "InstallerError",
            ErrorKind::CommandError => "CommandError",
            ErrorKind::PerClientQuotaExceeded => "PerClientQuotaExceeded",
            ErrorKind::GlobalQuotaExceeded => "GlobalQuotaExceeded",
            ErrorKind::ServerBusy => "ServerBusy",
            ErrorKind::UnknownEnvironment => "UnknownEnvironment",
            ErrorKind::WorkerStartupFailed => "WorkerStartupFailed",
            ErrorKind::WorkerDied => "WorkerDied",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Shutdown => "Shutdown",
            ErrorKind::MalformedRequest => "MalformedRequest",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The payload of an `exception` response frame.
///
/// # Example (JSON, inside the frame envelope)
/// ```json
/// {"kind":"exception","type":"UserCodeError","message":"ZeroDivisionError: division by zero","traceback":"..."}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exception {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl Exception {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(
        kind: ErrorKind,
        message: impl Into<String>,
        traceback: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            traceback: Some(traceback.into()),
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Infrastructure errors internal to the service.
#[derive(Debug, thiserror::Error)]
pub enum CillowError {
    #[error("channel closed")]
    ChannelClosed,

    #[error("frame of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown capture hook: {0}")]
    UnknownHook(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
