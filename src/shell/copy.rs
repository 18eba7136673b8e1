//! Bulk file copies through helper programs that ride the master connection:
//! an interactive `sftp` channel kept per session, or a one-shot `scp`.

use std::collections::HashSet;
use std::time::Instant;

use regex::Regex;
use tracing::debug;

use super::prompt::{auth_patterns, auth_reply, PromptConfig, Secrets};
use crate::error::{classify_diagnostic, Result, ShellError};
use crate::pty_session::{compile_pattern, ExitReason, LaunchSpec, PtyProcess, Timeout};

const SFTP_PROMPT: &str = r"sftp> $";
const MAX_AUTH_ANSWERS: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyFlags {
    pub recursive: bool,
}

/// Which side of the connection receives the files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    Upload,
    Download,
}

fn sftp_quote(path: &str) -> String {
    format!("\"{}\"", path.replace('\\', "\\\\").replace('"', "\\\""))
}

pub(crate) fn sftp_command(direction: CopyDirection, local: &str, remote: &str, flags: CopyFlags) -> String {
    let recursive = if flags.recursive { " -r" } else { "" };
    match direction {
        CopyDirection::Upload => format!("put{recursive} {} {}\n", sftp_quote(local), sftp_quote(remote)),
        CopyDirection::Download => {
            format!("get{recursive} {} {}\n", sftp_quote(remote), sftp_quote(local))
        }
    }
}

const SFTP_ERROR_MARKERS: &[&str] = &[
    "couldn't",
    "not found",
    "no such file",
    "permission denied",
    "is not a directory",
    "invalid",
    "remote open",
];

/// Lines sftp prints on success that may still quote user paths: the echoed
/// command, directory walks and progress meters.
fn is_transcript_echo(line: &str) -> bool {
    let line = line.strip_prefix("sftp>").map_or(line, str::trim_start);
    let echoed_command = ["put ", "get ", "put\t", "get\t"]
        .iter()
        .any(|verb| line.starts_with(verb));
    let progress = line.split_whitespace().any(|token| {
        token
            .strip_suffix('%')
            .is_some_and(|percent| !percent.is_empty() && percent.bytes().all(|b| b.is_ascii_digit()))
    });
    line.is_empty() || echoed_command || progress || line.starts_with("Entering ")
}

/// Destinations named by the `Uploading X to Y` / `Fetching X to Y` lines of
/// an sftp transfer, in order and without repeats.
pub(crate) fn parse_sftp_transfers(output: &str) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut files = Vec::new();
    let mut failure = None;
    for line in output.lines().map(str::trim) {
        if is_transcript_echo(line) {
            continue;
        }
        let announced = line
            .strip_prefix("Uploading ")
            .or_else(|| line.strip_prefix("Fetching "));
        if let Some((_, destination)) = announced.and_then(|rest| rest.rsplit_once(" to ")) {
            if seen.insert(destination.to_string()) {
                files.push(destination.to_string());
            }
            continue;
        }
        let lowered = line.to_ascii_lowercase();
        if SFTP_ERROR_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            failure.get_or_insert_with(|| line.to_string());
        }
    }
    match failure {
        Some(line) => Err(classify_diagnostic(&line, ShellError::TransferFailed)),
        None => Ok(files),
    }
}

/// Answer authentication questions until `done` matches. Without `done`,
/// keep answering until the process exits (reported as `ProcessDead`).
fn drive_until(
    process: &mut PtyProcess,
    done: Option<&Regex>,
    secrets: &Secrets,
    timeout: Timeout,
) -> Result<String> {
    let mut patterns = auth_patterns()?;
    let done_index = patterns.len();
    patterns.extend(done.cloned());
    let mut answers = 0;
    loop {
        let found = process.find_regex(&patterns, timeout)?.ok_or_else(|| {
            ShellError::PromptDetectionTimeout(format!(
                "`{}` showed no prompt in time",
                process.command().display()
            ))
        })?;
        if found.index == done_index {
            return Ok(found.text);
        }
        answers += 1;
        if answers > MAX_AUTH_ANSWERS {
            return Err(ShellError::AuthenticationFailed(format!(
                "`{}` keeps asking for credentials",
                process.command().display()
            )));
        }
        process.write(auth_reply(found.index, secrets)?)?;
    }
}

/// An `sftp` process sitting at its prompt.
pub struct SftpChannel {
    process: PtyProcess,
    prompt: Regex,
}

impl std::fmt::Debug for SftpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpChannel")
            .field("command", &self.process.command().display())
            .field("pid", &self.process.pid())
            .finish()
    }
}

impl SftpChannel {
    pub(crate) fn open(spec: LaunchSpec, secrets: &Secrets, config: &PromptConfig) -> Result<Self> {
        let prompt = compile_pattern(SFTP_PROMPT)?;
        let mut process = PtyProcess::new(spec)?;
        let started = Instant::now();
        match drive_until(&mut process, Some(&prompt), secrets, Timeout::After(config.timeout)) {
            Ok(_) => {
                debug!(elapsed = ?started.elapsed(), "sftp channel ready");
                Ok(Self { process, prompt })
            }
            Err(ShellError::ProcessDead(_)) => {
                let output = process.take_cache();
                Err(classify_diagnostic(&output, ShellError::ConnectionFailed))
            }
            Err(err) => Err(err),
        }
    }

    pub fn alive(&mut self) -> bool {
        self.process.alive(false)
    }

    /// Upload `local` to `remote`; returns the remote paths sftp reported.
    pub fn upload(&mut self, local: &str, remote: &str, flags: CopyFlags) -> Result<Vec<String>> {
        self.transfer(CopyDirection::Upload, local, remote, flags)
    }

    /// Download `remote` to `local`; returns the local paths sftp reported.
    pub fn download(&mut self, remote: &str, local: &str, flags: CopyFlags) -> Result<Vec<String>> {
        self.transfer(CopyDirection::Download, local, remote, flags)
    }

    pub(crate) fn transfer(
        &mut self,
        direction: CopyDirection,
        local: &str,
        remote: &str,
        flags: CopyFlags,
    ) -> Result<Vec<String>> {
        self.process.write(sftp_command(direction, local, remote, flags))?;
        let found = self
            .process
            .find_regex(std::slice::from_ref(&self.prompt), Timeout::Block)?
            .ok_or_else(|| ShellError::TransferFailed("sftp prompt did not return".to_string()))?;
        parse_sftp_transfers(&found.text)
    }

    pub fn close(mut self) -> Result<()> {
        let _ = self.process.write("bye\n");
        self.process.finalize()
    }
}

/// Run a copy program to completion, answering credential questions on the way.
pub(crate) fn run_one_shot(spec: LaunchSpec, secrets: &Secrets) -> Result<()> {
    let command_line = spec.display();
    let mut process = PtyProcess::new(spec)?;
    let outcome = drive_until(&mut process, None, secrets, Timeout::Block);
    let output = process.take_cache();
    match outcome {
        Err(ShellError::ProcessDead(_)) => {}
        Err(err) => return Err(err),
        Ok(_) => {}
    }
    match process.exit_reason() {
        Some(ExitReason::Code(0)) => Ok(()),
        other => {
            debug!(command = %command_line, exit = ?other, "one-shot copy failed");
            Err(classify_diagnostic(&output, ShellError::TransferFailed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn sftp_commands_quote_paths() {
        assert_eq!(
            sftp_command(CopyDirection::Upload, "/tmp/a b", "dir/\"x\"", CopyFlags::default()),
            "put \"/tmp/a b\" \"dir/\\\"x\\\"\"\n"
        );
        assert_eq!(
            sftp_command(CopyDirection::Download, "/l", "/r", CopyFlags { recursive: true }),
            "get -r \"/r\" \"/l\"\n"
        );
    }

    #[test]
    fn transfer_lines_become_destinations() {
        let output = "put -r \"/tmp/d\" \"/home/u/d\"\n\
                      Uploading /tmp/d/ to /home/u/d\n\
                      Entering /tmp/d/\n\
                      Uploading /tmp/d/a to /home/u/d/a\n\
                      a                       100%    5     1.0KB/s   00:00\n\
                      sftp> ";
        assert_eq!(
            parse_sftp_transfers(output).unwrap(),
            vec!["/home/u/d".to_string(), "/home/u/d/a".to_string()]
        );
    }

    #[test]
    fn marker_words_in_echoed_paths_are_not_failures() {
        let output = "sftp> put \"/tmp/invalid-names.txt\" \"/home/u/x\"\n\
                      Uploading /tmp/invalid-names.txt to /home/u/x\n\
                      invalid-names.txt       100%   12     3.1KB/s   00:00\n\
                      sftp> ";
        assert_eq!(parse_sftp_transfers(output).unwrap(), vec!["/home/u/x".to_string()]);

        let output = "get -r \"/srv/not found\" \"/tmp/couldn't\"\n\
                      Fetching /srv/not found/ to /tmp/couldn't\n\
                      Entering /srv/not found/\n\
                      sftp> ";
        assert_eq!(parse_sftp_transfers(output).unwrap(), vec!["/tmp/couldn't".to_string()]);
    }

    #[rstest]
    #[case("put \"/tmp/a\" \"/r\"\nstat /tmp/missing: No such file or directory", "parameter")]
    #[case("stat /tmp/missing: No such file or directory", "parameter")]
    #[case("remote open(\"/root/x\"): Permission denied", "authorization")]
    #[case("Couldn't canonicalize: Failure", "transfer")]
    fn sftp_failures_are_classified(#[case] output: &str, #[case] kind: &str) {
        let err = parse_sftp_transfers(output).unwrap_err();
        let actual = match err {
            ShellError::BadParameter(_) => "parameter",
            ShellError::AuthorizationFailed(_) => "authorization",
            ShellError::TransferFailed(_) => "transfer",
            other => panic!("unexpected error: {other}"),
        };
        assert_eq!(actual, kind);
    }

    #[test]
    fn one_shot_copy_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.txt");
        std::fs::write(&source, "payload").unwrap();
        let target = dir.path().join("dst.txt");
        let spec = LaunchSpec::new([
            "cp".to_string(),
            source.display().to_string(),
            target.display().to_string(),
        ]);
        run_one_shot(spec, &Secrets::default()).unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "payload");

        let missing = LaunchSpec::new(["cp", "/definitely/missing/file", "/tmp/"]);
        let err = run_one_shot(missing, &Secrets::default()).unwrap_err();
        assert!(matches!(err, ShellError::BadParameter(_)), "{err}");
    }

    #[test]
    fn one_shot_copy_answers_password_questions() {
        let spec = LaunchSpec::new([
            "/bin/sh",
            "-c",
            "printf 'Password: '; read -r pw; [ \"$pw\" = open ]",
        ]);
        let secrets = Secrets {
            password: Some("open".into()),
            ..Secrets::default()
        };
        run_one_shot(spec, &secrets).unwrap();
    }
}
