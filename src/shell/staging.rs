//! Moving file content through the shell's own terminal, without a separate
//! transfer program: heredocs for plain text, `printf` octal escapes for
//! anything else, and a hex dump for reading content back.

use std::fmt::Write as _;

use tracing::debug;

use super::command::{frame_command, IoMode};
use crate::error::{classify_diagnostic, Result, ShellError};

const HEREDOC_SENTINEL: &str = "SHELLPOOL_STAGE_EOF";
/// Kept well under the canonical-mode line limit of the terminal driver.
const HEREDOC_LINE_LIMIT: usize = 1000;
const PRINTF_CHUNK_BYTES: usize = 200;
const PRINTF_LINES_PER_ROUND: usize = 32;

/// One framed command sent to the shell, answered by its exit status and the
/// raw text printed before the next prompt.
pub(crate) trait RoundTrip {
    fn round_trip(&mut self, framed: &str) -> Result<(i32, String)>;
}

/// `data` as text, if every line can travel through a quoted heredoc unchanged.
pub(crate) fn heredoc_text(data: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(data).ok()?;
    let unsafe_char = text.chars().any(|c| c.is_control() && c != '\n');
    let unsafe_line = text
        .split('\n')
        .any(|line| line.len() > HEREDOC_LINE_LIMIT || line == HEREDOC_SENTINEL);
    if unsafe_char || unsafe_line {
        return None;
    }
    Some(text)
}

/// `head -c` trims the newline the heredoc always adds after the last line.
pub(crate) fn heredoc_command(text: &str, target: &str) -> String {
    let mut body = text.to_string();
    if !body.ends_with('\n') {
        body.push('\n');
    }
    format!(
        "head -c {} > {target} <<'{HEREDOC_SENTINEL}'\n{body}{HEREDOC_SENTINEL}",
        text.len()
    )
}

fn is_printf_literal(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
        || matches!(byte, b' ' | b'.' | b',' | b'_' | b'-' | b'/' | b':' | b'=' | b'+')
}

/// Escape bytes for a single-quoted `printf` format string. Every escape uses
/// three octal digits so a following literal digit is never absorbed.
pub(crate) fn printf_escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4);
    for &byte in bytes {
        if is_printf_literal(byte) {
            out.push(byte as char);
        } else {
            let _ = write!(out, "\\{byte:03o}");
        }
    }
    out
}

/// Rounds of `printf` lines writing `data` to `target`; the first round truncates.
pub(crate) fn printf_rounds(data: &[u8], target: &str) -> Vec<String> {
    let lines: Vec<String> = data
        .chunks(PRINTF_CHUNK_BYTES)
        .map(|chunk| format!("printf '{}'", printf_escape(chunk)))
        .collect();
    if lines.is_empty() {
        return vec![format!(": > {target}")];
    }
    lines
        .chunks(PRINTF_LINES_PER_ROUND)
        .enumerate()
        .map(|(round, group)| {
            let redirect = if round == 0 { ">" } else { ">>" };
            format!("{{\n{}\n}} {redirect} {target}", group.join("\n"))
        })
        .collect()
}

pub(crate) fn parse_size(output: &str) -> Result<u64> {
    let trimmed = output.trim();
    trimmed.parse().map_err(|_| {
        ShellError::TransferFailed(format!("unexpected size report `{trimmed}`"))
    })
}

/// Decode `od -An -v -tx1` output.
pub(crate) fn decode_hex_dump(dump: &str) -> Result<Vec<u8>> {
    dump.split_whitespace()
        .map(|token| {
            u8::from_str_radix(token, 16).map_err(|_| {
                ShellError::TransferFailed(format!("unexpected hex dump token `{token}`"))
            })
        })
        .collect()
}

fn run_checked<R: RoundTrip>(shell: &mut R, command: &str, seq: u64) -> Result<String> {
    let (status, output) = shell.round_trip(&frame_command(command, IoMode::Merge, seq))?;
    if status != 0 {
        return Err(classify_diagnostic(&output, ShellError::TransferFailed));
    }
    Ok(output)
}

/// Write `data` to `path` on the shell's side: content goes to a sibling
/// scratch file which is renamed over `path` and size-checked.
pub(crate) fn stage_to_remote<R: RoundTrip>(
    shell: &mut R,
    data: &[u8],
    path: &str,
    seq: u64,
) -> Result<()> {
    if path.trim().is_empty() {
        return Err(ShellError::BadParameter("staging path is empty".to_string()));
    }
    let target = shell_words::quote(path).into_owned();
    let scratch = shell_words::quote(&format!("{path}.shellpool-{seq}.tmp")).into_owned();

    let rounds = match heredoc_text(data) {
        Some(text) => vec![heredoc_command(text, &scratch)],
        None => printf_rounds(data, &scratch),
    };
    debug!(path, bytes = data.len(), rounds = rounds.len(), "staging to remote");

    let written = rounds
        .iter()
        .try_for_each(|round| run_checked(shell, round, seq).map(|_| ()))
        .and_then(|()| run_checked(shell, &format!("mv -f {scratch} {target} && wc -c < {target}"), seq));
    let report = match written {
        Ok(report) => report,
        Err(err) => {
            if !matches!(err, ShellError::ProcessDead(_)) {
                let _ = shell.round_trip(&frame_command(
                    &format!("rm -f {scratch}"),
                    IoMode::Ignore,
                    seq,
                ));
            }
            return Err(err);
        }
    };

    let size = parse_size(&report)?;
    if size != data.len() as u64 {
        return Err(ShellError::TransferFailed(format!(
            "{path}: staged {} bytes but the file holds {size}",
            data.len()
        )));
    }
    Ok(())
}

/// Read `path` from the shell's side as a hex dump, so file content can never
/// be mistaken for a prompt or mangled by the terminal driver.
pub(crate) fn stage_from_remote<R: RoundTrip>(shell: &mut R, path: &str, seq: u64) -> Result<Vec<u8>> {
    if path.trim().is_empty() {
        return Err(ShellError::BadParameter("staging path is empty".to_string()));
    }
    let target = shell_words::quote(path).into_owned();
    let size = parse_size(&run_checked(shell, &format!("wc -c < {target}"), seq)?)?;

    debug!(path, bytes = size, "reading hex dump from remote");
    let bytes = decode_hex_dump(&run_checked(shell, &format!("od -An -v -tx1 {target}"), seq)?)?;
    if bytes.len() as u64 != size {
        return Err(ShellError::TransferFailed(format!(
            "{path}: expected {size} bytes, decoded {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}
