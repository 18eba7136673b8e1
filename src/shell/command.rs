//! Command framing for a negotiated shell: how a caller's command line is
//! wrapped for each I/O mode and how the text before the prompt is split up.

use serde::Serialize;

use crate::error::{Result, ShellError};

/// What happens to a command's stdout and stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IoMode {
    /// Discard both streams.
    Ignore,
    /// Both streams interleaved into `stdout`.
    #[default]
    Merge,
    /// Streams returned separately; stderr goes through a scratch file.
    Separate,
    StdoutOnly,
    StderrOnly,
}

/// Outcome of one synchronous command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Reject commands that cannot be framed: empty ones and ones that would put
/// themselves in the background, which would detach their status from the prompt.
pub(crate) fn validate_command(command: &str) -> Result<&str> {
    let trimmed = command.trim_end();
    if trimmed.trim().is_empty() {
        return Err(ShellError::BadParameter("command is empty".to_string()));
    }
    if trimmed.ends_with('&') && !trimmed.ends_with("&&") {
        return Err(ShellError::BadParameter(format!(
            "background commands are not supported: `{trimmed}`"
        )));
    }
    Ok(trimmed)
}

/// Per-command scratch file for `IoMode::Separate`.
pub(crate) fn stderr_scratch_path(seq: u64) -> String {
    format!("\"${{TMPDIR:-/tmp}}/.shellpool-stderr-$$-{seq}\"")
}

/// Wrap `command` in a brace group whose redirections implement `mode`.
///
/// The closing brace sits on its own line so a trailing comment in the
/// command cannot swallow it.
pub(crate) fn frame_command(command: &str, mode: IoMode, seq: u64) -> String {
    let redirect = match mode {
        IoMode::Ignore => ">/dev/null 2>&1".to_string(),
        IoMode::Merge => "2>&1".to_string(),
        IoMode::Separate => format!("2>{}", stderr_scratch_path(seq)),
        IoMode::StdoutOnly => "2>/dev/null".to_string(),
        IoMode::StderrOnly => "2>&1 >/dev/null".to_string(),
    };
    format!("{{ {command}\n}} {redirect}\n")
}

/// Second round trip for `IoMode::Separate`: print and remove the scratch file.
pub(crate) fn collect_stderr_command(seq: u64) -> String {
    let path = stderr_scratch_path(seq);
    format!("cat {path} 2>/dev/null; rm -f {path}\n")
}

/// Assign the text printed before the prompt to the stream(s) `mode` keeps.
pub(crate) fn split_output(mode: IoMode, status: i32, text: String, stderr: Option<String>) -> CommandOutput {
    let (stdout, stderr) = match mode {
        IoMode::Ignore => (String::new(), String::new()),
        IoMode::Merge | IoMode::StdoutOnly => (text, String::new()),
        IoMode::StderrOnly => (String::new(), text),
        IoMode::Separate => (text, stderr.unwrap_or_default()),
    };
    CommandOutput {
        status,
        stdout,
        stderr,
    }
}

/// Remove terminal control sequences a command may have printed.
pub(crate) fn strip_terminal_codes(text: &str) -> String {
    if !text.contains('\u{1b}') {
        return text.to_string();
    }
    strip_ansi_escapes::strip_str(text)
}
