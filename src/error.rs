//! Error taxonomy shared by the process, session, supervisor and registry layers.

use std::io;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = ShellError> = std::result::Result<T, E>;

/// Failures surfaced by shellpool operations.
///
/// Low-level I/O and program diagnostics are folded into these kinds so callers
/// can branch on the variant instead of parsing raw terminal text.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to spawn process: {0}")]
    ProcessSpawnFailed(String),

    #[error("process is not alive: {0}")]
    ProcessDead(String),

    #[error("could not detect shell prompt: {0}")]
    PromptDetectionTimeout(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("transfer failed: {0}")]
    TransferFailed(String),

    #[error("unknown object: {0}")]
    UnknownObject(String),

    #[error("command execution failed: {0}")]
    CommandExecutionFailed(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("pty I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ShellError {
    /// True for errors that leave the underlying process unusable.
    #[must_use]
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Self::ProcessDead(_) | Self::PromptDetectionTimeout(_) | Self::CommandExecutionFailed(_)
        )
    }
}

/// Diagnostic markers checked in order; the first hit decides the kind.
const DIAGNOSTIC_MARKERS: &[(&str, DiagnosticKind)] = &[
    ("man-in-the-middle", DiagnosticKind::Authentication),
    ("host key verification failed", DiagnosticKind::Authentication),
    ("possible dns spoofing", DiagnosticKind::Authentication),
    ("too many authentication failures", DiagnosticKind::Authentication),
    ("authentication failed", DiagnosticKind::Authentication),
    ("permission denied", DiagnosticKind::Authorization),
    ("not authorized", DiagnosticKind::Authorization),
    ("connection refused", DiagnosticKind::Connection),
    ("could not resolve hostname", DiagnosticKind::Connection),
    ("name or service not known", DiagnosticKind::Connection),
    ("no route to host", DiagnosticKind::Connection),
    ("connection timed out", DiagnosticKind::Connection),
    ("connection closed", DiagnosticKind::Connection),
    ("connection reset", DiagnosticKind::Connection),
    ("no such file or directory", DiagnosticKind::Parameter),
    ("is a directory", DiagnosticKind::Parameter),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiagnosticKind {
    Authentication,
    Authorization,
    Connection,
    Parameter,
}

/// Translate the diagnostic output of a spawned program into an error kind.
///
/// `fallback` builds the error when no known marker is present.
pub fn classify_diagnostic(text: &str, fallback: fn(String) -> ShellError) -> ShellError {
    let lowered = text.to_ascii_lowercase();
    let summary = last_meaningful_line(text);
    for (marker, kind) in DIAGNOSTIC_MARKERS {
        if !lowered.contains(marker) {
            continue;
        }
        return match kind {
            DiagnosticKind::Authentication => ShellError::AuthenticationFailed(summary),
            DiagnosticKind::Authorization => ShellError::AuthorizationFailed(summary),
            DiagnosticKind::Connection => ShellError::ConnectionFailed(summary),
            DiagnosticKind::Parameter => ShellError::BadParameter(summary),
        };
    }
    fallback(summary)
}

fn last_meaningful_line(text: &str) -> String {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no diagnostic output")
        .to_string()
}
