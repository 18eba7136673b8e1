//! Shell sessions on top of a pty process: prompt negotiation, synchronous and
//! asynchronous commands, content staging, and file copies.
//!
//! A session is shared as `Arc<ShellSession>`. Every operation first opens an
//! activity scope with the idle supervisor (reviving the session if it was
//! finalized for idleness) and then locks the session state, always in that
//! order.

mod command;
mod copy;
mod prompt;
mod staging;

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, warn};

pub use command::{CommandOutput, IoMode};
pub use copy::{CopyDirection, CopyFlags, SftpChannel};
pub use prompt::{PromptConfig, PromptEvent, Secrets, SHELL_PROMPT_PATTERN};

use self::command::{
    collect_stderr_command, frame_command, split_output, strip_terminal_codes, validate_command,
};
pub(crate) use self::copy::run_one_shot;
use self::prompt::{compile_prompt, negotiate, prompt_status};
use self::staging::RoundTrip;
use crate::config::CopyMode;
use crate::error::{classify_diagnostic, Result, ShellError};
use crate::lifecycle::Lifecycle;
use crate::lock::lock_or_recover;
use crate::pty_session::{compile_pattern, LaunchSpec, PtyProcess, Timeout};
use crate::registry::{ConnectionRegistry, Credential, MasterConnection};
use crate::supervisor::{ActivityScope, IdleSupervisor};

const GRACEFUL_EXIT: Duration = Duration::from_secs(1);
const GRACEFUL_EXIT_POLL: Duration = Duration::from_millis(20);
const RESYNC_WINDOW: Duration = Duration::from_millis(200);

/// How a session is set up around its launch command.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Name used in logs; defaults to the launch command.
    pub label: Option<String>,
    pub secrets: Secrets,
    pub prompt: PromptConfig,
    /// Supervisor that may finalize the session when idle and revive it on use.
    pub supervisor: Option<Arc<IdleSupervisor>>,
    /// Idle period before the supervisor finalizes the session; zero disables.
    pub idle_timeout: Duration,
    /// Copy transport for remote `copy_to`/`copy_from`; the master's
    /// configured mode when unset.
    pub copy_mode: Option<CopyMode>,
}

struct SessionState {
    process: Option<PtyProcess>,
    prompt: Regex,
    initialized: bool,
    broken: bool,
    pending_async: bool,
    copy_channel: Option<SftpChannel>,
    trigger_seq: u32,
    command_seq: u64,
}

impl SessionState {
    fn new() -> Result<Self> {
        Ok(Self {
            process: None,
            prompt: compile_pattern(SHELL_PROMPT_PATTERN)?,
            initialized: false,
            broken: false,
            pending_async: false,
            copy_channel: None,
            trigger_seq: 0,
            command_seq: 0,
        })
    }

    fn process_mut(&mut self) -> Result<&mut PtyProcess> {
        self.process
            .as_mut()
            .ok_or_else(|| ShellError::ProcessDead("session has no running shell".to_string()))
    }

    fn next_command_seq(&mut self) -> u64 {
        self.command_seq += 1;
        self.command_seq
    }

    /// Consume the prompt of an outstanding `run_async` before framing a new command.
    fn settle(&mut self) -> Result<()> {
        if !self.pending_async {
            return Ok(());
        }
        let SessionState {
            process, prompt, ..
        } = self;
        let process = process
            .as_mut()
            .ok_or_else(|| ShellError::ProcessDead("session has no running shell".to_string()))?;
        process.find_regex(std::slice::from_ref(&*prompt), Timeout::Block)?;
        self.pending_async = false;
        Ok(())
    }

    /// Tear down the shell and any copy channel. The session stays revivable.
    fn retire(&mut self) -> Result<()> {
        self.initialized = false;
        self.pending_async = false;
        if let Some(channel) = self.copy_channel.take() {
            if let Err(err) = channel.close() {
                debug!(error = %err, "closing copy channel failed");
            }
        }
        match self.process.take() {
            Some(mut process) => process.finalize(),
            None => Ok(()),
        }
    }
}

impl RoundTrip for SessionState {
    fn round_trip(&mut self, framed: &str) -> Result<(i32, String)> {
        let SessionState {
            process, prompt, ..
        } = self;
        let process = process
            .as_mut()
            .ok_or_else(|| ShellError::ProcessDead("session has no running shell".to_string()))?;
        process.write(framed)?;
        let found = process
            .find_regex(std::slice::from_ref(&*prompt), Timeout::Block)?
            .ok_or_else(|| {
                ShellError::CommandExecutionFailed("prompt did not return".to_string())
            })?;
        let (status, start) = prompt_status(prompt, &found.text).ok_or_else(|| {
            ShellError::CommandExecutionFailed(format!(
                "cannot read exit status from prompt `{}`",
                found.text.get(found.text.len().saturating_sub(40)..).unwrap_or_default()
            ))
        })?;
        let mut text = found.text;
        text.truncate(start);
        Ok((status, text))
    }
}

/// An interactive shell driven through its terminal.
pub struct ShellSession {
    label: String,
    launch: LaunchSpec,
    secrets: Secrets,
    prompt_config: PromptConfig,
    idle_timeout: Duration,
    supervisor: Option<Arc<IdleSupervisor>>,
    supervised: AtomicBool,
    master: Option<Arc<MasterConnection>>,
    copy_mode: Option<CopyMode>,
    state: Mutex<SessionState>,
}

impl fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellSession")
            .field("label", &self.label)
            .field("command", &self.launch.display())
            .field("supervised", &self.supervised.load(Ordering::Acquire))
            .field("shared_master", &self.master.is_some())
            .finish()
    }
}

impl ShellSession {
    /// Start `launch` under a pty and negotiate its prompt.
    ///
    /// # Errors
    ///
    /// Spawn failures, authentication failures, and `PromptDetectionTimeout`
    /// when the program never shows a usable prompt.
    pub fn spawn(launch: LaunchSpec, options: SessionOptions) -> Result<Arc<Self>> {
        Self::spawn_with_master(launch, options, None)
    }

    /// Open a session for `url` through `registry`, sharing its master connection.
    pub fn open(
        registry: &ConnectionRegistry,
        url: &str,
        credentials: &[Credential],
    ) -> Result<Arc<Self>> {
        registry.open_shell(url, credentials)
    }

    pub(crate) fn spawn_with_master(
        launch: LaunchSpec,
        options: SessionOptions,
        master: Option<Arc<MasterConnection>>,
    ) -> Result<Arc<Self>> {
        let label = options.label.unwrap_or_else(|| launch.display());
        let session = Arc::new(Self {
            label,
            launch,
            secrets: options.secrets,
            prompt_config: options.prompt,
            idle_timeout: options.idle_timeout,
            supervisor: options.supervisor,
            supervised: AtomicBool::new(false),
            master,
            copy_mode: options.copy_mode,
            state: Mutex::new(SessionState::new()?),
        });
        if let Some(supervisor) = &session.supervisor {
            supervisor.register(&session, session.idle_timeout);
            session.supervised.store(true, Ordering::Release);
        }
        if let Err(err) = Lifecycle::initialize(session.as_ref()) {
            session.unsupervise();
            return Err(err);
        }
        Ok(session)
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn launch(&self) -> &LaunchSpec {
        &self.launch
    }

    /// Pid of the shell process, while one is running.
    #[must_use]
    pub fn pid(&self) -> Option<i32> {
        lock_or_recover(&self.state, "shell session")
            .process
            .as_ref()
            .and_then(PtyProcess::pid)
    }

    #[must_use]
    pub fn prompt_pattern(&self) -> String {
        lock_or_recover(&self.state, "shell session")
            .prompt
            .as_str()
            .to_string()
    }

    /// Whether the last (re)initialization failed.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        lock_or_recover(&self.state, "shell session").broken
    }

    fn unsupervise(&self) {
        if !self.supervised.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(supervisor) = &self.supervisor {
            let _ = supervisor.unregister(self);
        }
    }

    fn mark_dead(&self) {
        if !self.supervised.load(Ordering::Acquire) {
            return;
        }
        if let Some(supervisor) = &self.supervisor {
            let _ = supervisor.mark_dead(self);
        }
    }

    /// Count as activity without doing anything, reviving the session if needed.
    pub(crate) fn touch(&self) {
        if let Err(err) = self.enter() {
            debug!(session = %self.label, error = %err, "touch failed");
        }
    }

    fn enter(&self) -> Result<Option<ActivityScope>> {
        if let Some(master) = &self.master {
            master.touch();
        }
        match &self.supervisor {
            Some(supervisor) if self.supervised.load(Ordering::Acquire) => {
                supervisor.activity(self).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Run `f` against the initialized session state inside an activity scope.
    /// Errors that leave the shell unusable finalize it; the next activity
    /// revives it.
    fn with_session<R>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut SessionState) -> Result<R>,
    ) -> Result<R> {
        let scope = self.enter()?;
        let mut state = lock_or_recover(&self.state, "shell session");
        if !state.initialized {
            return Err(ShellError::ProcessDead(format!(
                "{op}: session `{}` is finalized",
                self.label
            )));
        }
        let result = f(&mut state);
        if let Err(err) = &result {
            if err.is_fatal_to_session() {
                warn!(session = %self.label, op, error = %err, "finalizing shell session");
                if let Err(finalize_err) = state.retire() {
                    debug!(error = %finalize_err, "finalize after failure reported an error");
                }
                drop(state);
                self.mark_dead();
            }
        }
        drop(scope);
        result
    }

    /// Run `command` to completion and return its exit status and output.
    ///
    /// # Errors
    ///
    /// `BadParameter` for empty or backgrounded (`cmd &`) commands,
    /// `ProcessDead` when the shell died (the session is finalized), and
    /// `CommandExecutionFailed` when no prompt follows the command.
    pub fn run_sync(&self, command: &str, mode: IoMode) -> Result<CommandOutput> {
        let command = validate_command(command)?;
        let output = self.with_session("run_sync", |state| {
            state.settle()?;
            let seq = state.next_command_seq();
            let (status, text) = state.round_trip(&frame_command(command, mode, seq))?;
            let stderr = if mode == IoMode::Separate {
                let (_, text) = state.round_trip(&collect_stderr_command(seq))?;
                Some(strip_terminal_codes(&text))
            } else {
                None
            };
            Ok(split_output(mode, status, strip_terminal_codes(&text), stderr))
        })?;
        debug!(session = %self.label, ?mode, status = output.status, "command finished");
        Ok(output)
    }

    /// Start `command` without waiting; collect it later with [`find_prompt`](Self::find_prompt).
    pub fn run_async(&self, command: &str) -> Result<()> {
        let command = validate_command(command)?;
        self.with_session("run_async", |state| {
            state.settle()?;
            let seq = state.next_command_seq();
            state
                .process_mut()?
                .write(frame_command(command, IoMode::Merge, seq))?;
            state.pending_async = true;
            Ok(())
        })
    }

    /// Wait for the next prompt and return the exit status it reports together
    /// with the text printed before it. `Ok(None)` when `timeout` elapses.
    pub fn find_prompt(&self, timeout: Timeout) -> Result<Option<(i32, String)>> {
        self.with_session("find_prompt", |state| {
            let SessionState {
                process,
                prompt,
                pending_async,
                ..
            } = state;
            let process = process.as_mut().ok_or_else(|| {
                ShellError::ProcessDead("session has no running shell".to_string())
            })?;
            let Some(found) = process.find_regex(std::slice::from_ref(&*prompt), timeout)? else {
                return Ok(None);
            };
            let (status, start) = prompt_status(prompt, &found.text).ok_or_else(|| {
                ShellError::CommandExecutionFailed("cannot read exit status from prompt".into())
            })?;
            *pending_async = false;
            Ok(Some((status, strip_terminal_codes(&found.text[..start]))))
        })
    }

    /// Switch to a caller-defined prompt, typically after changing `PS1`.
    ///
    /// The pattern must have exactly one capture group holding the exit status.
    /// It is accepted once it matches a status-0 prompt after a flush marker;
    /// otherwise the previous pattern stays in effect.
    pub fn set_prompt(&self, pattern: &str) -> Result<()> {
        let candidate = compile_prompt(pattern)?;
        let timeout = self.prompt_config.timeout;
        self.with_session("set_prompt", |state| {
            let seq = state.next_command_seq();
            // unanchored: a pending prompt from an async PS1 change precedes the marker
            let marker = compile_pattern(&format!("FLUSH_{seq}_MARK"))?;
            state.pending_async = false;
            let previous = state.prompt.clone();
            let process = state.process_mut()?;
            process.write(format!("printf 'FLUSH_%s_MARK\\n' {seq}\n"))?;
            if process
                .find_regex(std::slice::from_ref(&marker), Timeout::After(timeout))?
                .is_none()
            {
                return Err(ShellError::BadParameter(format!(
                    "prompt pattern `{pattern}` rejected: shell did not answer the flush marker"
                )));
            }
            let accepted = process
                .find_regex(std::slice::from_ref(&candidate), Timeout::After(timeout))?
                .and_then(|found| prompt_status(&candidate, &found.text))
                .is_some_and(|(status, _)| status == 0);
            if accepted {
                debug!(session = %self.label, pattern, "prompt pattern replaced");
                state.prompt = candidate;
                return Ok(());
            }
            // the old prompt is still pending after the marker
            process.find_regex(std::slice::from_ref(&previous), Timeout::After(RESYNC_WINDOW))?;
            Err(ShellError::BadParameter(format!(
                "prompt pattern `{pattern}` did not match a successful prompt"
            )))
        })
    }

    /// Write `data` to `path` on the session's side of the connection.
    pub fn stage_to_remote(&self, data: &[u8], path: &str) -> Result<()> {
        self.with_session("stage_to_remote", |state| {
            state.settle()?;
            let seq = state.next_command_seq();
            staging::stage_to_remote(state, data, path, seq)
        })
    }

    /// Read `path` from the session's side of the connection.
    pub fn stage_from_remote(&self, path: &str) -> Result<Vec<u8>> {
        self.with_session("stage_from_remote", |state| {
            state.settle()?;
            let seq = state.next_command_seq();
            staging::stage_from_remote(state, path, seq)
        })
    }

    /// Copy a local file or tree to `remote`. Returns the transferred paths as
    /// reported by the copy program (empty for one-shot `scp`).
    pub fn copy_to(&self, local: &Path, remote: &str, flags: CopyFlags) -> Result<Vec<String>> {
        self.copy(CopyDirection::Upload, local, remote, flags)
    }

    /// Copy `remote` to a local file or tree.
    pub fn copy_from(&self, remote: &str, local: &Path, flags: CopyFlags) -> Result<Vec<String>> {
        self.copy(CopyDirection::Download, local, remote, flags)
    }

    fn copy(
        &self,
        direction: CopyDirection,
        local: &Path,
        remote: &str,
        flags: CopyFlags,
    ) -> Result<Vec<String>> {
        let local = local.to_str().ok_or_else(|| {
            ShellError::BadParameter(format!("local path {} is not UTF-8", local.display()))
        })?;
        let Some(master) = self.master.as_ref().filter(|master| master.is_remote()) else {
            return self.copy_through_shell(direction, local, remote, flags);
        };
        match self.copy_mode.unwrap_or_else(|| master.copy_mode()) {
            CopyMode::Scp => {
                master.touch();
                run_one_shot(master.scp_spec(direction, local, remote, flags)?, master.secrets())?;
                Ok(Vec::new())
            }
            CopyMode::Sftp => self.with_session("copy", |state| {
                let reusable = state.copy_channel.as_mut().is_some_and(SftpChannel::alive);
                if !reusable {
                    if let Some(stale) = state.copy_channel.take() {
                        let _ = stale.close();
                    }
                    let channel =
                        SftpChannel::open(master.sftp_spec()?, master.secrets(), &self.prompt_config)
                            .map_err(non_fatal)?;
                    state.copy_channel = Some(channel);
                }
                let Some(channel) = state.copy_channel.as_mut() else {
                    return Err(ShellError::TransferFailed("copy channel unavailable".into()));
                };
                let result = channel.transfer(direction, local, remote, flags);
                if matches!(result, Err(ShellError::ProcessDead(_))) {
                    state.copy_channel = None;
                }
                result.map_err(non_fatal)
            }),
        }
    }

    fn copy_through_shell(
        &self,
        direction: CopyDirection,
        local: &str,
        remote: &str,
        flags: CopyFlags,
    ) -> Result<Vec<String>> {
        let (source, destination) = match direction {
            CopyDirection::Upload => (local, remote),
            CopyDirection::Download => (remote, local),
        };
        let recursive = if flags.recursive { " -R" } else { "" };
        let command = format!(
            "cp{recursive} -- {} {}",
            shell_words::quote(source),
            shell_words::quote(destination)
        );
        let output = self.run_sync(&command, IoMode::Merge)?;
        if !output.success() {
            return Err(classify_diagnostic(&output.stdout, ShellError::TransferFailed));
        }
        Ok(vec![destination.to_string()])
    }

    /// Whether the shell is running, reaping it if it exited. With `recover`,
    /// a dead session is initialized again.
    pub fn alive(&self, recover: bool) -> bool {
        let alive = {
            let mut state = lock_or_recover(&self.state, "shell session");
            let alive = state.initialized
                && state
                    .process
                    .as_mut()
                    .is_some_and(|process| process.alive(false));
            if !alive && state.initialized {
                let _ = state.retire();
            }
            alive
        };
        if alive {
            return true;
        }
        self.mark_dead();
        if !recover {
            return false;
        }
        match &self.supervisor {
            Some(supervisor) if self.supervised.load(Ordering::Acquire) => {
                supervisor.revive(self).unwrap_or(false)
            }
            _ => Lifecycle::initialize(self).is_ok(),
        }
    }

    /// Stop the session and release it from supervision.
    ///
    /// With `kill == false` the shell is asked to `exit` first and given a
    /// moment before it is signalled.
    pub fn finalize(&self, kill: bool) -> Result<()> {
        self.unsupervise();
        let mut state = lock_or_recover(&self.state, "shell session");
        if !kill {
            if let Some(process) = state.process.as_mut() {
                if process.write("exit\n").is_ok() {
                    let started = Instant::now();
                    while process.alive(false) && started.elapsed() < GRACEFUL_EXIT {
                        thread::sleep(GRACEFUL_EXIT_POLL);
                    }
                }
            }
        }
        debug!(session = %self.label, kill, "finalizing shell session");
        state.retire()
    }
}

/// Copy-channel failures must not finalize the shell session they ride on.
fn non_fatal(err: ShellError) -> ShellError {
    match err {
        ShellError::ProcessDead(reason) | ShellError::CommandExecutionFailed(reason) => {
            ShellError::ConnectionFailed(format!("copy channel: {reason}"))
        }
        ShellError::PromptDetectionTimeout(reason) => {
            ShellError::ConnectionFailed(format!("copy channel never became ready: {reason}"))
        }
        other => other,
    }
}

impl Lifecycle for ShellSession {
    fn initialize(&self) -> Result<()> {
        let mut state = lock_or_recover(&self.state, "shell session");
        if state.initialized && state.process.as_mut().is_some_and(|process| process.alive(false)) {
            return Ok(());
        }
        let _ = state.retire();
        let mut process = PtyProcess::new(self.launch.clone())?;
        let negotiated = negotiate(
            &mut process,
            &self.secrets,
            &self.prompt_config,
            &mut state.trigger_seq,
        );
        let prompt = match negotiated {
            Ok(prompt) => prompt,
            Err(err) => {
                let _ = process.finalize();
                state.broken = true;
                warn!(session = %self.label, error = %err, "shell initialization failed");
                return Err(err);
            }
        };
        state.process = Some(process);
        state.prompt = prompt;
        state.initialized = true;
        state.broken = false;
        debug!(session = %self.label, "shell session ready");
        Ok(())
    }

    fn finalize(&self) -> Result<()> {
        lock_or_recover(&self.state, "shell session").retire()
    }

    fn describe(&self) -> String {
        format!("shell `{}`", self.label)
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        self.unsupervise();
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = state.retire();
    }
}
