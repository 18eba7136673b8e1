//! Prompt negotiation: drive a freshly spawned shell (possibly behind ssh
//! authentication) until it shows a prompt that carries the last exit status.

use std::fmt;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::debug;

use crate::config::{DEFAULT_POLL_WINDOW_MS, DEFAULT_PROMPT_TIMEOUT_SECS, DEFAULT_TRIGGER_RETRIES};
use crate::error::{classify_diagnostic, Result, ShellError};
use crate::pty_session::{compile_pattern, PtyProcess, Timeout};

/// Prompt installed once negotiation succeeds. Capture group 1 is `$?`.
pub const SHELL_PROMPT_PATTERN: &str = r"PROMPT-(\d+)->";

const INSTALL_PROMPT_COMMAND: &str = "stty -echo 2>/dev/null; set +o histexpand 2>/dev/null; \
unset PROMPT_COMMAND; unset HISTFILE; PS1='PROMPT-$?->'; PS2=''; export PS1 PS2\n";

const TRANSCRIPT_LIMIT: usize = 4096;

/// Negotiation patterns, checked in this order on every search.
const NEGOTIATION_PATTERNS: [(&str, EventKind); 6] = [
    (r"(?i)password[^\n]*:\s*$", EventKind::Password),
    (r"(?i)enter passphrase[^\n]*:\s*$", EventKind::Passphrase),
    (
        r"(?i)(passcode|token_response|verification code)[^\n]*:\s*$",
        EventKind::Token,
    ),
    (r"(?i)want to continue connecting[^\n]*\?\s*$", EventKind::HostKey),
    (r"SYNC_(\d+)_MARK\s*$", EventKind::Trigger),
    (r"[\$#%>\]]\s*$", EventKind::Native),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptConfig {
    /// Overall deadline for negotiation and for prompt changes.
    pub timeout: Duration,
    /// Quiet period after which a synchronization trigger is sent.
    pub poll_window: Duration,
    /// Triggers sent before giving up.
    pub max_triggers: u32,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs_f64(DEFAULT_PROMPT_TIMEOUT_SECS),
            poll_window: Duration::from_millis(DEFAULT_POLL_WINDOW_MS),
            max_triggers: DEFAULT_TRIGGER_RETRIES,
        }
    }
}

/// Answers for the interactive questions a login may ask.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secrets {
    pub password: Option<String>,
    pub passphrase: Option<String>,
    /// One-time token; the password is offered when unset.
    pub token: Option<String>,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = |value: &Option<String>| value.as_ref().map(|_| "<redacted>");
        f.debug_struct("Secrets")
            .field("password", &shown(&self.password))
            .field("passphrase", &shown(&self.passphrase))
            .field("token", &shown(&self.token))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Password,
    Passphrase,
    Token,
    HostKey,
    Trigger,
    Native,
}

/// What the peer is showing us right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptEvent {
    Password,
    Passphrase,
    Token,
    HostKey,
    /// A synchronization marker came back; carries its sequence number.
    Trigger(u32),
    /// Something that looks like an ordinary shell prompt.
    Native,
}

impl PromptEvent {
    fn from_match(index: usize, text: &str, trigger: &Regex) -> Option<Self> {
        let (_, kind) = NEGOTIATION_PATTERNS.get(index)?;
        Some(match kind {
            EventKind::Password => PromptEvent::Password,
            EventKind::Passphrase => PromptEvent::Passphrase,
            EventKind::Token => PromptEvent::Token,
            EventKind::HostKey => PromptEvent::HostKey,
            EventKind::Native => PromptEvent::Native,
            EventKind::Trigger => {
                let seq = trigger
                    .captures(text)
                    .and_then(|caps| caps.get(1))
                    .and_then(|digits| digits.as_str().parse().ok())?;
                PromptEvent::Trigger(seq)
            }
        })
    }
}

fn negotiation_patterns() -> Result<Vec<Regex>> {
    NEGOTIATION_PATTERNS
        .iter()
        .map(|(pattern, _)| compile_pattern(pattern))
        .collect()
}

/// Only the authentication questions, for helper programs (`sftp`, `scp`) that
/// never show a shell prompt.
pub(crate) fn auth_patterns() -> Result<Vec<Regex>> {
    NEGOTIATION_PATTERNS
        .iter()
        .filter(|(_, kind)| !matches!(kind, EventKind::Trigger | EventKind::Native))
        .map(|(pattern, _)| compile_pattern(pattern))
        .collect()
}

/// Reply to the question matched by `auth_patterns()[index]`.
pub(crate) fn auth_reply(index: usize, secrets: &Secrets) -> Result<String> {
    let (secret, what) = match NEGOTIATION_PATTERNS.get(index).map(|(_, kind)| *kind) {
        Some(EventKind::Password) => (secrets.password.clone(), "password"),
        Some(EventKind::Passphrase) => (secrets.passphrase.clone(), "key passphrase"),
        Some(EventKind::Token) => (
            secrets.token.clone().or_else(|| secrets.password.clone()),
            "one-time token",
        ),
        Some(EventKind::HostKey) => (Some("yes".to_string()), "host key confirmation"),
        _ => (None, "answer"),
    };
    secret.map(|secret| format!("{secret}\n")).ok_or_else(|| {
        ShellError::AuthenticationFailed(format!("{what} requested but none configured"))
    })
}

/// Parse the exit status captured by `prompt` in `text` and where the prompt starts.
pub(crate) fn prompt_status(prompt: &Regex, text: &str) -> Option<(i32, usize)> {
    let caps = prompt.captures(text)?;
    let start = caps.get(0)?.start();
    let status = caps.get(1)?.as_str().trim().parse().ok()?;
    Some((status, start))
}

/// Validate a caller-supplied prompt pattern: it must compile and have exactly
/// one capture group, the exit status.
pub(crate) fn compile_prompt(pattern: &str) -> Result<Regex> {
    let regex = compile_pattern(pattern).map_err(|err| ShellError::BadParameter(err.to_string()))?;
    let groups = regex.captures_len() - 1;
    if groups != 1 {
        return Err(ShellError::BadParameter(format!(
            "prompt pattern `{pattern}` must have exactly one capture group, found {groups}"
        )));
    }
    Ok(regex)
}

pub(crate) fn trigger_command(seq: u32) -> String {
    // the format string keeps the echoed command line from matching the marker
    format!("printf 'SYNC_%s_MARK\\n' {seq}\n")
}

/// Last few kilobytes of negotiation output, for diagnostics.
#[derive(Debug, Default)]
struct Transcript {
    text: String,
}

impl Transcript {
    fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if self.text.len() > TRANSCRIPT_LIMIT {
            let mut cut = self.text.len() - TRANSCRIPT_LIMIT;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
        }
    }
}

#[derive(Debug, Default)]
struct Answered {
    password: bool,
    passphrase: bool,
    token: bool,
}

struct Negotiation<'a> {
    process: &'a mut PtyProcess,
    secrets: &'a Secrets,
    config: &'a PromptConfig,
    deadline: Instant,
    transcript: Transcript,
    answered: Answered,
    triggers_sent: u32,
    awaited: Option<u32>,
    /// The awaited trigger came back; the next native prompt is the shell's.
    synced: bool,
}

/// Negotiate until the exit-status prompt is installed and confirmed.
///
/// `seq` numbers synchronization triggers across negotiations of one session.
/// Returns the compiled session prompt.
///
/// # Errors
///
/// `AuthenticationFailed` when a secret is requested but missing or rejected,
/// `PromptDetectionTimeout` when the trigger allowance or the deadline runs out,
/// and a classified error when the process exits during negotiation.
pub(crate) fn negotiate(
    process: &mut PtyProcess,
    secrets: &Secrets,
    config: &PromptConfig,
    seq: &mut u32,
) -> Result<Regex> {
    let mut negotiation = Negotiation {
        process,
        secrets,
        config,
        deadline: Instant::now() + config.timeout,
        transcript: Transcript::default(),
        answered: Answered::default(),
        triggers_sent: 0,
        awaited: None,
        synced: false,
    };
    match negotiation.run(seq) {
        Err(ShellError::ProcessDead(reason)) => {
            let tail = negotiation.process.take_cache();
            negotiation.transcript.push(&tail);
            debug!(%reason, "process exited during prompt negotiation");
            Err(classify_diagnostic(
                &negotiation.transcript.text,
                ShellError::ProcessDead,
            ))
        }
        other => other,
    }
}

impl Negotiation<'_> {
    fn run(&mut self, seq: &mut u32) -> Result<Regex> {
        let patterns = negotiation_patterns()?;
        let trigger = &patterns[4];
        loop {
            let window = self.remaining()?.min(self.config.poll_window);
            let Some(found) = self.process.find_regex(&patterns, Timeout::After(window))? else {
                if self.synced {
                    // the shell answered the trigger but its prompt has an unknown shape
                    return self.install_prompt();
                }
                self.send_trigger(seq)?;
                continue;
            };
            self.transcript.push(&found.text);
            let Some(event) = PromptEvent::from_match(found.index, &found.text, trigger) else {
                continue;
            };
            debug!(?event, "prompt negotiation event");
            match event {
                PromptEvent::Password => {
                    let secret = self.secrets.password.clone();
                    self.answer(secret, "password", |answered| &mut answered.password)?;
                }
                PromptEvent::Passphrase => {
                    let secret = self.secrets.passphrase.clone();
                    self.answer(secret, "key passphrase", |answered| &mut answered.passphrase)?;
                }
                PromptEvent::Token => {
                    let secret = self
                        .secrets
                        .token
                        .clone()
                        .or_else(|| self.secrets.password.clone());
                    self.answer(secret, "one-time token", |answered| &mut answered.token)?;
                }
                PromptEvent::HostKey => self.process.write("yes\n")?,
                PromptEvent::Trigger(n) if Some(n) == self.awaited => self.synced = true,
                PromptEvent::Trigger(_) => {}
                PromptEvent::Native if self.synced => return self.install_prompt(),
                PromptEvent::Native => {
                    if self.awaited.is_none() {
                        self.send_trigger(seq)?;
                    }
                }
            }
        }
    }

    fn remaining(&self) -> Result<Duration> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(self.timeout_error("deadline elapsed"));
        }
        Ok(remaining)
    }

    fn timeout_error(&self, why: &str) -> ShellError {
        let seen = self
            .transcript
            .text
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("no output");
        ShellError::PromptDetectionTimeout(format!(
            "{why} after {} trigger(s); last output: {seen}",
            self.triggers_sent
        ))
    }

    fn send_trigger(&mut self, seq: &mut u32) -> Result<()> {
        if self.triggers_sent >= self.config.max_triggers {
            return Err(self.timeout_error("no prompt"));
        }
        *seq = seq.wrapping_add(1);
        self.triggers_sent += 1;
        self.awaited = Some(*seq);
        self.process.write(trigger_command(*seq))
    }

    fn answer(
        &mut self,
        secret: Option<String>,
        what: &str,
        flag: impl FnOnce(&mut Answered) -> &mut bool,
    ) -> Result<()> {
        let Some(secret) = secret else {
            return Err(ShellError::AuthenticationFailed(format!(
                "{what} requested but none configured"
            )));
        };
        let answered = flag(&mut self.answered);
        if *answered {
            return Err(ShellError::AuthenticationFailed(format!("{what} rejected")));
        }
        *answered = true;
        self.process.write(format!("{secret}\n"))
    }

    fn install_prompt(&mut self) -> Result<Regex> {
        let prompt = compile_pattern(SHELL_PROMPT_PATTERN)?;
        self.process.write(INSTALL_PROMPT_COMMAND)?;
        loop {
            let remaining = self.remaining()?;
            let found = self
                .process
                .find_regex(std::slice::from_ref(&prompt), Timeout::After(remaining))?;
            let Some(found) = found else {
                return Err(self.timeout_error("exit-status prompt never appeared"));
            };
            self.transcript.push(&found.text);
            if matches!(prompt_status(&prompt, &found.text), Some((0, _))) {
                debug!(triggers = self.triggers_sent, "exit-status prompt installed");
                return Ok(prompt);
            }
        }
    }
}
