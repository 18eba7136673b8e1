//! Child processes attached to a pseudo-terminal, driven through blocking reads
//! with timeouts and regex searches over their accumulated output.

use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{env, fmt, io, ptr, thread};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, TryRecvError};
use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use super::io::{spawn_reader_thread, write_all};
use super::timeout::Timeout;
use crate::error::{Result, ShellError};
use crate::process_signal::signal_process_group_or_pid;

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 200;
const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);
const FIND_POLL_INTERVAL: Duration = Duration::from_millis(50);
const EOF_BACKOFF: Duration = Duration::from_millis(10);
const TERMINATION_GRACE: Duration = Duration::from_millis(500);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Upper bound on re-initializations performed by one `alive(true)` call.
pub const MAX_REVIVE_ATTEMPTS: u32 = 3;

const STAGE_SETSID: i32 = 1;
const STAGE_CONTROLLING_TTY: i32 = 2;
const STAGE_DUP2: i32 = 3;
const STAGE_CHDIR: i32 = 4;
const STAGE_EXEC: i32 = 5;

/// What to run and how: argument vector, environment overrides, working
/// directory and the `TERM` value exported to the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub term: String,
}

impl LaunchSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            working_dir: None,
            term: crate::config::DEFAULT_TERM_VALUE.to_string(),
        }
    }

    /// Split a single command line into an argument vector using shell quoting rules.
    pub fn from_command_line(line: &str) -> Result<Self> {
        let argv = shell_words::split(line)
            .map_err(|err| ShellError::InvalidArgument(format!("cannot split `{line}`: {err}")))?;
        if argv.is_empty() {
            return Err(ShellError::InvalidArgument(
                "command line is empty".to_string(),
            ));
        }
        Ok(Self::new(argv))
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.env.retain(|(existing, _)| *existing != key);
        self.env.push((key, value.into()));
        self
    }

    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn term(mut self, term: impl Into<String>) -> Self {
        self.term = term.into();
        self
    }

    /// The command as a copy-pasteable shell line.
    #[must_use]
    pub fn display(&self) -> String {
        shell_words::join(&self.argv)
    }
}

/// Callback run against the process right after a spawn or right before teardown.
pub type ProcessHook = Box<dyn FnMut(&mut PtyProcess) -> Result<()> + Send>;

#[derive(Default)]
pub struct ProcessHooks {
    pub on_initialize: Option<ProcessHook>,
    pub on_finalize: Option<ProcessHook>,
}

impl fmt::Debug for ProcessHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHooks")
            .field("on_initialize", &self.on_initialize.is_some())
            .field("on_finalize", &self.on_finalize.is_some())
            .finish()
    }
}

/// How a child generation ended. Exit code and signal are exclusive by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Code(i32),
    Signal(i32),
}

impl ExitReason {
    fn from_wait_status(status: i32) -> Option<Self> {
        let status = ExitStatus::from_raw(status);
        status
            .code()
            .map(ExitReason::Code)
            .or_else(|| status.signal().map(ExitReason::Signal))
    }

    #[must_use]
    pub fn code(self) -> Option<i32> {
        match self {
            ExitReason::Code(code) => Some(code),
            ExitReason::Signal(_) => None,
        }
    }

    #[must_use]
    pub fn signal(self) -> Option<i32> {
        match self {
            ExitReason::Signal(signal) => Some(signal),
            ExitReason::Code(_) => None,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Code(code) => write!(f, "exit code {code}"),
            ExitReason::Signal(signal) => write!(f, "signal {signal}"),
        }
    }
}

/// Result of a successful [`PtyProcess::find`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindMatch {
    /// Position of the matching pattern in the list that was searched.
    pub index: usize,
    /// Everything consumed from the output, up to and including the match.
    pub text: String,
}

/// A child process running on the slave side of a pty.
///
/// stdin, stdout and stderr all point at the same slave, so stderr output is
/// interleaved with stdout. Output is collected by a reader thread and kept in
/// a cache until `read` or `find` consume it.
///
/// Not internally synchronized: every driving method takes `&mut self`, and
/// owners that share a process across threads wrap it in a mutex.
pub struct PtyProcess {
    spec: LaunchSpec,
    hooks: ProcessHooks,
    channel: Option<PtyChannel>,
    cache: String,
    exit: Option<ExitReason>,
    generation: u64,
}

impl fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtyProcess")
            .field("command", &self.spec.display())
            .field("pid", &self.pid())
            .field("generation", &self.generation)
            .field("exit", &self.exit)
            .field("cached_bytes", &self.cache.len())
            .finish()
    }
}

impl PtyProcess {
    /// Spawn `spec` under a fresh pty.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty argument vector, `ProcessSpawnFailed` when the
    /// pty, fork or exec fails (commonly an exhausted pty quota or a missing program).
    pub fn new(spec: LaunchSpec) -> Result<Self> {
        Self::with_hooks(spec, ProcessHooks::default())
    }

    /// Spawn a command given as one shell-quoted line.
    pub fn from_command_line(line: &str) -> Result<Self> {
        Self::new(LaunchSpec::from_command_line(line)?)
    }

    /// Spawn `spec` and run `hooks.on_initialize` against the new child.
    pub fn with_hooks(spec: LaunchSpec, hooks: ProcessHooks) -> Result<Self> {
        if spec.argv.is_empty() {
            return Err(ShellError::InvalidArgument(
                "argument vector is empty".to_string(),
            ));
        }
        let mut process = Self {
            spec,
            hooks,
            channel: None,
            cache: String::new(),
            exit: None,
            generation: 0,
        };
        process.start()?;
        Ok(process)
    }

    fn start(&mut self) -> Result<()> {
        let channel = PtyChannel::open(&self.spec)?;
        self.generation += 1;
        self.cache.clear();
        self.exit = None;
        debug!(
            pid = channel.child_pid,
            generation = self.generation,
            command = %self.spec.display(),
            "pty process spawned"
        );
        self.channel = Some(channel);
        if let Err(err) = self.run_initialize_hook() {
            warn!(command = %self.spec.display(), error = %err, "initialize hook failed");
            let _ = self.finalize();
            return Err(err);
        }
        Ok(())
    }

    fn run_initialize_hook(&mut self) -> Result<()> {
        let Some(mut hook) = self.hooks.on_initialize.take() else {
            return Ok(());
        };
        let result = hook(self);
        self.hooks.on_initialize.get_or_insert(hook);
        result
    }

    fn run_finalize_hook(&mut self) -> Result<()> {
        let Some(mut hook) = self.hooks.on_finalize.take() else {
            return Ok(());
        };
        let result = hook(self);
        self.hooks.on_finalize.get_or_insert(hook);
        result
    }

    #[must_use]
    pub fn command(&self) -> &LaunchSpec {
        &self.spec
    }

    /// Pid of the current generation's child, while it has not been finalized.
    #[must_use]
    pub fn pid(&self) -> Option<i32> {
        self.channel.as_ref().map(|channel| channel.child_pid)
    }

    #[must_use]
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.channel.is_none()
    }

    /// Output received but not yet consumed.
    #[must_use]
    pub fn cached(&self) -> &str {
        &self.cache
    }

    /// Consume everything cached so far, without reading more.
    pub fn take_cache(&mut self) -> String {
        std::mem::take(&mut self.cache)
    }

    fn ensure_alive(&self, op: &str) -> Result<()> {
        if self.channel.is_some() {
            return Ok(());
        }
        Err(self.dead_error(op))
    }

    fn dead_error(&self, op: &str) -> ShellError {
        let reason = self
            .exit
            .map(|reason| format!(" ({reason})"))
            .unwrap_or_default();
        ShellError::ProcessDead(format!("{op} on `{}`{reason}", self.spec.display()))
    }

    fn pull(&mut self, mode: PullMode) -> Result<Pulled> {
        let rx = match &self.channel {
            Some(channel) => channel.output_rx.clone(),
            None => return Err(self.dead_error("read")),
        };
        let mut pulled = Pulled::default();
        let first = match mode {
            PullMode::Drain => None,
            PullMode::Wait(limit) => match rx.recv_timeout(limit) {
                Ok(chunk) => Some(chunk),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => {
                    pulled.disconnected = true;
                    None
                }
            },
            PullMode::Block => match rx.recv() {
                Ok(chunk) => Some(chunk),
                Err(_) => {
                    pulled.disconnected = true;
                    None
                }
            },
        };
        if let Some(chunk) = first {
            self.cache.push_str(&chunk);
            pulled.received = true;
        }
        loop {
            match rx.try_recv() {
                Ok(chunk) => {
                    self.cache.push_str(&chunk);
                    pulled.received = true;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    pulled.disconnected = true;
                    break;
                }
            }
        }
        Ok(pulled)
    }

    fn take_cached(&mut self, max_size: usize) -> String {
        if max_size == 0 {
            return String::new();
        }
        if self.cache.len() <= max_size {
            return std::mem::take(&mut self.cache);
        }
        let mut cut = max_size;
        while cut > 0 && !self.cache.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            cut = self.cache.chars().next().map_or(0, char::len_utf8);
        }
        let rest = self.cache.split_off(cut);
        std::mem::replace(&mut self.cache, rest)
    }

    /// Return up to `max_size` bytes of output.
    ///
    /// `Timeout::Poll` takes what has arrived, `Timeout::Block` waits for at
    /// least one chunk (or end of stream), `Timeout::After` keeps polling until
    /// `max_size` bytes are available or the time is up.
    ///
    /// # Errors
    ///
    /// `ProcessDead` if the process has been finalized.
    pub fn read(&mut self, max_size: usize, timeout: Timeout) -> Result<String> {
        self.ensure_alive("read")?;
        let start = Instant::now();
        match timeout {
            Timeout::Poll => {
                self.pull(PullMode::Drain)?;
            }
            Timeout::Block => {
                let mode = if self.cache.is_empty() {
                    PullMode::Block
                } else {
                    PullMode::Drain
                };
                self.pull(mode)?;
            }
            Timeout::After(_) => loop {
                let pulled = self.pull(PullMode::Drain)?;
                if self.cache.len() >= max_size || pulled.disconnected || timeout.expired(start) {
                    break;
                }
                let slice = timeout.slice(start, READ_POLL_INTERVAL);
                if slice.is_zero() {
                    break;
                }
                self.pull(PullMode::Wait(slice))?;
            },
        }
        Ok(self.take_cached(max_size))
    }

    /// Search the output for the first of `patterns` (in list order) that matches.
    ///
    /// Patterns are compiled multi-line with `.` matching newlines.
    pub fn find<S: AsRef<str>>(
        &mut self,
        patterns: &[S],
        timeout: Timeout,
    ) -> Result<Option<FindMatch>> {
        let compiled = compile_patterns(patterns)?;
        self.find_regex(&compiled, timeout)
    }

    /// [`find`](Self::find) over already compiled patterns.
    ///
    /// Returns `Ok(None)` when the timeout elapses without a match; text after
    /// the match stays cached for the next call.
    ///
    /// # Errors
    ///
    /// `ProcessDead` if the process is finalized, or if its output ends and the
    /// child turns out to have exited.
    pub fn find_regex(
        &mut self,
        patterns: &[Regex],
        timeout: Timeout,
    ) -> Result<Option<FindMatch>> {
        self.ensure_alive("find")?;
        if patterns.is_empty() {
            return Err(ShellError::InvalidArgument(
                "find needs at least one pattern".to_string(),
            ));
        }
        let start = Instant::now();
        if let Some(found) = self.match_cached(patterns) {
            return Ok(Some(found));
        }
        loop {
            let slice = timeout.slice(start, FIND_POLL_INTERVAL);
            let mode = if slice.is_zero() {
                PullMode::Drain
            } else {
                PullMode::Wait(slice)
            };
            let pulled = self.pull(mode)?;
            if pulled.received {
                if let Some(found) = self.match_cached(patterns) {
                    return Ok(Some(found));
                }
            } else if pulled.disconnected {
                if !self.check_running() {
                    return Err(self.dead_error("find"));
                }
                if !slice.is_zero() {
                    thread::sleep(EOF_BACKOFF);
                }
            }
            if timeout.expired(start) {
                return Ok(None);
            }
        }
    }

    fn match_cached(&mut self, patterns: &[Regex]) -> Option<FindMatch> {
        for (index, pattern) in patterns.iter().enumerate() {
            if let Some(found) = pattern.find(&self.cache) {
                let rest = self.cache.split_off(found.end());
                let text = std::mem::replace(&mut self.cache, rest);
                return Some(FindMatch { index, text });
            }
        }
        None
    }

    /// Write all of `data` to the child's terminal.
    ///
    /// # Errors
    ///
    /// `ProcessDead` when the process is finalized or its terminal is gone.
    pub fn write(&mut self, data: impl AsRef<[u8]>) -> Result<()> {
        let Some(channel) = self.channel.as_ref() else {
            return Err(self.dead_error("write"));
        };
        match write_all(channel.master_fd, data.as_ref()) {
            Ok(()) => Ok(()),
            Err(err) if is_dead_terminal_error(&err) => {
                Err(ShellError::ProcessDead(format!("write failed: {err}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Non-blocking reap: finalizes and returns false once the child has exited.
    fn check_running(&mut self) -> bool {
        let Some(channel) = self.channel.as_mut() else {
            return false;
        };
        let pid = channel.child_pid;
        match reap(pid, libc::WNOHANG) {
            Reap::Running => return true,
            Reap::Exited(status) => {
                channel.reaped = true;
                if self.exit.is_none() {
                    self.exit = ExitReason::from_wait_status(status);
                }
            }
            Reap::Gone => {
                channel.reaped = true;
            }
        }
        debug!(pid, exit = ?self.exit, "pty child exited");
        if let Err(err) = self.finalize() {
            warn!(pid, error = %err, "finalize after exit failed");
        }
        false
    }

    /// Whether the child is still running, reaping it if it has exited.
    ///
    /// With `recover`, a dead process is re-spawned (new generation) up to
    /// [`MAX_REVIVE_ATTEMPTS`] times before giving up.
    pub fn alive(&mut self, recover: bool) -> bool {
        let mut revivals = 0;
        loop {
            if self.check_running() {
                return true;
            }
            if !recover || revivals >= MAX_REVIVE_ATTEMPTS {
                return false;
            }
            revivals += 1;
            if let Err(err) = self.revive() {
                warn!(
                    command = %self.spec.display(),
                    attempt = revivals,
                    error = %err,
                    "pty process revival failed"
                );
            }
        }
    }

    /// Block until the child exits, then finalize. Returns how it ended.
    pub fn wait(&mut self) -> Option<ExitReason> {
        if let Some(channel) = self.channel.as_mut() {
            if !channel.reaped {
                if let Reap::Exited(status) = reap(channel.child_pid, 0) {
                    self.exit.get_or_insert_with(|| {
                        ExitReason::from_wait_status(status).unwrap_or(ExitReason::Code(-1))
                    });
                }
                channel.reaped = true;
            }
        }
        if let Err(err) = self.finalize() {
            warn!(command = %self.spec.display(), error = %err, "finalize after wait failed");
        }
        self.exit
    }

    /// Start a new generation: finalize the current child (if any) and spawn again.
    pub fn revive(&mut self) -> Result<()> {
        if let Err(err) = self.finalize() {
            debug!(error = %err, "finalize before revive reported an error");
        }
        self.start()
    }

    /// Run the finalize hook, then terminate the process group (hang-up and
    /// terminate, then kill after a grace period) and reap the child.
    ///
    /// Idempotent. Output that arrived before teardown stays in the cache. The
    /// hook's error, if any, is returned after teardown has completed.
    pub fn finalize(&mut self) -> Result<()> {
        if self.channel.is_none() {
            return Ok(());
        }
        let hook_result = self.run_finalize_hook();
        let Some(mut channel) = self.channel.take() else {
            return hook_result;
        };
        if !channel.reaped {
            let reason = terminate_child(channel.child_pid);
            channel.reaped = true;
            if self.exit.is_none() {
                self.exit = reason;
            }
        }
        let tail = channel.shutdown();
        self.cache.push_str(&tail);
        debug!(
            pid = channel.child_pid,
            generation = self.generation,
            exit = ?self.exit,
            "pty process finalized"
        );
        hook_result
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        // hooks may reference owners that are already being torn down
        self.hooks = ProcessHooks::default();
        let _ = self.finalize();
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Pulled {
    received: bool,
    disconnected: bool,
}

#[derive(Debug, Clone, Copy)]
enum PullMode {
    Drain,
    Wait(Duration),
    Block,
}

pub(crate) fn compile_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| compile_pattern(pattern.as_ref()))
        .collect()
}

/// Compile with the search flags every prompt pattern uses.
pub(crate) fn compile_pattern(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .multi_line(true)
        .dot_matches_new_line(true)
        .build()
        .map_err(|err| ShellError::InvalidArgument(format!("invalid pattern `{pattern}`: {err}")))
}

fn is_dead_terminal_error(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::BrokenPipe {
        return true;
    }
    matches!(
        err.raw_os_error(),
        Some(code)
            if code == libc::EIO || code == libc::EPIPE || code == libc::ENXIO || code == libc::EBADF
    )
}

struct PtyChannel {
    master_fd: RawFd,
    child_pid: i32,
    output_rx: Receiver<String>,
    stop: Arc<AtomicBool>,
    reader: Option<thread::JoinHandle<()>>,
    reaped: bool,
}

impl PtyChannel {
    fn open(spec: &LaunchSpec) -> Result<Self> {
        let plan = ExecPlan::prepare(spec)?;
        // SAFETY: every pointer handed to the child comes from `plan`, which outlives the fork.
        let (master_fd, child_pid) = unsafe { spawn_pty_child(&plan)? };

        // SAFETY: master_fd was just returned by openpty and is owned here.
        if let Err(err) = unsafe { set_nonblocking(master_fd) } {
            terminate_child(child_pid);
            // SAFETY: master_fd is still open and owned here.
            unsafe { close_fd(master_fd) };
            return Err(err);
        }

        let (tx, rx) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let reader = match spawn_reader_thread(master_fd, tx, Arc::clone(&stop)) {
            Ok(handle) => handle,
            Err(err) => {
                terminate_child(child_pid);
                // SAFETY: no reader thread owns the fd; it is still open.
                unsafe { close_fd(master_fd) };
                return Err(ShellError::ProcessSpawnFailed(format!(
                    "cannot start pty reader thread: {err}"
                )));
            }
        };

        Ok(Self {
            master_fd,
            child_pid,
            output_rx: rx,
            stop,
            reader: Some(reader),
            reaped: false,
        })
    }

    /// Stop the reader, collect what it already forwarded, close the master.
    fn shutdown(&mut self) -> String {
        if self.master_fd < 0 {
            return String::new();
        }
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                warn!(pid = self.child_pid, "pty reader thread panicked");
            }
        }
        let tail: String = self.output_rx.try_iter().collect();
        // SAFETY: the reader thread has been joined, so nothing else uses the fd.
        unsafe { close_fd(self.master_fd) };
        self.master_fd = -1;
        tail
    }
}

impl Drop for PtyChannel {
    fn drop(&mut self) {
        if !self.reaped {
            terminate_child(self.child_pid);
            self.reaped = true;
        }
        let _ = self.shutdown();
    }
}

/// Everything the child needs after `fork`, prepared up front so the child
/// only performs async-signal-safe calls.
struct ExecPlan {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    working_dir: Option<CString>,
}

impl ExecPlan {
    fn prepare(spec: &LaunchSpec) -> Result<Self> {
        let Some(first) = spec.argv.first() else {
            return Err(ShellError::InvalidArgument(
                "argument vector is empty".to_string(),
            ));
        };
        let search_path = spec
            .env
            .iter()
            .find(|(key, _)| key == "PATH")
            .map(|(_, value)| OsString::from(value))
            .or_else(|| env::var_os("PATH"));
        let program = resolve_program(first, search_path.as_deref()).ok_or_else(|| {
            ShellError::ProcessSpawnFailed(format!("program not found: {first}"))
        })?;
        let program = c_string(program.as_os_str().as_bytes(), "program path")?;

        let argv = spec
            .argv
            .iter()
            .map(|arg| c_string(arg.as_bytes(), "argument"))
            .collect::<Result<Vec<_>>>()?;

        let mut envp = Vec::new();
        for (key, value) in env::vars_os() {
            let overridden = key == "TERM"
                || spec
                    .env
                    .iter()
                    .any(|(name, _)| OsStr::new(name) == key.as_os_str());
            if overridden {
                continue;
            }
            let mut entry = key.into_vec();
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            if let Ok(entry) = CString::new(entry) {
                envp.push(entry);
            }
        }
        for (key, value) in &spec.env {
            envp.push(c_string(
                format!("{key}={value}").as_bytes(),
                "environment entry",
            )?);
        }
        envp.push(c_string(format!("TERM={}", spec.term).as_bytes(), "TERM value")?);

        let working_dir = spec
            .working_dir
            .as_ref()
            .map(|dir| c_string(dir.as_os_str().as_bytes(), "working directory"))
            .transpose()?;

        Ok(Self {
            program,
            argv,
            envp,
            working_dir,
        })
    }
}

fn c_string(bytes: &[u8], what: &str) -> Result<CString> {
    CString::new(bytes)
        .map_err(|_| ShellError::InvalidArgument(format!("{what} contains a NUL byte")))
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    let mut pointers: Vec<*const libc::c_char> = strings.iter().map(|s| s.as_ptr()).collect();
    pointers.push(ptr::null());
    pointers
}

fn resolve_program(name: &str, search_path: Option<&OsStr>) -> Option<PathBuf> {
    if name.contains('/') {
        return Some(PathBuf::from(name));
    }
    let search_path = search_path?;
    env::split_paths(search_path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Open a pty, fork, and exec the planned program on its slave side.
///
/// Exec failures are reported back through a close-on-exec status pipe, so a
/// missing binary fails construction instead of producing a dead child.
///
/// # Safety
///
/// Must not be called while other threads hold locks the child could need;
/// the child only uses async-signal-safe calls on pre-built data.
unsafe fn spawn_pty_child(plan: &ExecPlan) -> Result<(RawFd, i32)> {
    let mut master_fd: RawFd = -1;
    let mut slave_fd: RawFd = -1;
    let mut status_fds = [-1; 2];
    let mut winsize = libc::winsize {
        ws_row: DEFAULT_ROWS,
        ws_col: DEFAULT_COLS,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    #[allow(clippy::unnecessary_mut_passed)]
    // SAFETY: openpty expects valid pointers for master/slave/winsize; we pass stack locals.
    if libc::openpty(
        &mut master_fd,
        &mut slave_fd,
        ptr::null_mut(),
        ptr::null_mut(),
        &mut winsize,
    ) != 0
    {
        return Err(spawn_error("openpty"));
    }

    if open_status_pipe(&mut status_fds) != 0 {
        let err = spawn_error("pipe(exec status)");
        close_fd(master_fd);
        close_fd(slave_fd);
        return Err(err);
    }

    let all_fds = [master_fd, slave_fd, status_fds[0], status_fds[1]];
    for fd in all_fds {
        if let Err(err) = set_cloexec(fd) {
            for fd in all_fds {
                close_fd(fd);
            }
            return Err(err);
        }
    }

    let argv_ptrs = null_terminated(&plan.argv);
    let envp_ptrs = null_terminated(&plan.envp);

    let pid = libc::fork();
    if pid < 0 {
        let err = spawn_error("fork");
        for fd in all_fds {
            close_fd(fd);
        }
        return Err(err);
    }

    if pid == 0 {
        close_fd(status_fds[0]);
        child_exec(master_fd, slave_fd, status_fds[1], plan, &argv_ptrs, &envp_ptrs);
    }

    close_fd(slave_fd);
    close_fd(status_fds[1]);
    let failure = read_exec_status(status_fds[0]);
    close_fd(status_fds[0]);

    if let Some((stage, errno)) = failure {
        let _ = reap(pid, 0);
        close_fd(master_fd);
        return Err(ShellError::ProcessSpawnFailed(format!(
            "{} failed for {:?}: {}",
            stage_name(stage),
            plan.program,
            io::Error::from_raw_os_error(errno)
        )));
    }

    Ok((master_fd, pid))
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
unsafe fn open_status_pipe(fds: &mut [RawFd; 2]) -> libc::c_int {
    libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC)
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
unsafe fn open_status_pipe(fds: &mut [RawFd; 2]) -> libc::c_int {
    libc::pipe(fds.as_mut_ptr())
}

/// Child side after `fork`: new session, pty as controlling terminal and stdio, exec.
///
/// # Safety
///
/// Only valid in the freshly forked child. Never returns.
unsafe fn child_exec(
    master_fd: RawFd,
    slave_fd: RawFd,
    status_fd: RawFd,
    plan: &ExecPlan,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
) -> ! {
    close_fd(master_fd);

    if libc::setsid() == -1 {
        report_exec_failure(status_fd, STAGE_SETSID);
    }
    if libc::ioctl(slave_fd, libc::TIOCSCTTY as libc::c_ulong, 0) == -1 {
        report_exec_failure(status_fd, STAGE_CONTROLLING_TTY);
    }
    if libc::dup2(slave_fd, libc::STDIN_FILENO) < 0
        || libc::dup2(slave_fd, libc::STDOUT_FILENO) < 0
        || libc::dup2(slave_fd, libc::STDERR_FILENO) < 0
    {
        report_exec_failure(status_fd, STAGE_DUP2);
    }
    if slave_fd > libc::STDERR_FILENO {
        close_fd(slave_fd);
    }

    if let Some(dir) = &plan.working_dir {
        if libc::chdir(dir.as_ptr()) != 0 {
            report_exec_failure(status_fd, STAGE_CHDIR);
        }
    }

    // Rust ignores SIGPIPE and the parent may block signals; neither should leak into the child.
    let mut mask: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut mask);
    libc::pthread_sigmask(libc::SIG_SETMASK, &mask, ptr::null_mut());
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);

    libc::execve(plan.program.as_ptr(), argv.as_ptr(), envp.as_ptr());
    report_exec_failure(status_fd, STAGE_EXEC);
}

unsafe fn report_exec_failure(status_fd: RawFd, stage: i32) -> ! {
    let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
    let mut payload = [0u8; 8];
    payload[..4].copy_from_slice(&stage.to_ne_bytes());
    payload[4..].copy_from_slice(&errno.to_ne_bytes());
    let _ = libc::write(
        status_fd,
        payload.as_ptr() as *const libc::c_void,
        payload.len(),
    );
    libc::_exit(127);
}

fn read_exec_status(fd: RawFd) -> Option<(i32, i32)> {
    let mut payload = [0u8; 8];
    let mut filled = 0usize;
    while filled < payload.len() {
        // SAFETY: reading into the unfilled tail of a stack buffer.
        let n = unsafe {
            libc::read(
                fd,
                payload[filled..].as_mut_ptr() as *mut libc::c_void,
                payload.len() - filled,
            )
        };
        if n == 0 {
            break;
        }
        if n < 0 {
            if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            break;
        }
        filled += n as usize;
    }
    if filled < payload.len() {
        return None;
    }
    let stage = i32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let errno = i32::from_ne_bytes([payload[4], payload[5], payload[6], payload[7]]);
    Some((stage, errno))
}

fn stage_name(stage: i32) -> &'static str {
    match stage {
        STAGE_SETSID => "setsid",
        STAGE_CONTROLLING_TTY => "ioctl(TIOCSCTTY)",
        STAGE_DUP2 => "dup2",
        STAGE_CHDIR => "chdir",
        STAGE_EXEC => "execve",
        _ => "child setup",
    }
}

fn spawn_error(context: &str) -> ShellError {
    ShellError::ProcessSpawnFailed(format!("{context}: {}", io::Error::last_os_error()))
}

/// Configure the pty master for non-blocking reads.
///
/// # Safety
///
/// `fd` must be a valid, open file descriptor.
unsafe fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = libc::fcntl(fd, libc::F_GETFL, 0);
    if flags < 0 {
        return Err(spawn_error("fcntl(F_GETFL)"));
    }
    if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
        return Err(spawn_error("fcntl(F_SETFL)"));
    }
    Ok(())
}

/// Mark a descriptor close-on-exec so it does not leak into unrelated children.
fn set_cloexec(fd: RawFd) -> Result<()> {
    if fd < 0 {
        return Ok(());
    }
    // SAFETY: fcntl on an fd we own; flags are plain integers.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(spawn_error("fcntl(F_GETFD)"));
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(spawn_error("fcntl(F_SETFD, FD_CLOEXEC)"));
    }
    Ok(())
}

/// Close a file descriptor while ignoring errors.
///
/// # Safety
///
/// `fd` must be owned by the caller (or negative, which is ignored).
unsafe fn close_fd(fd: RawFd) {
    if fd >= 0 {
        let _ = libc::close(fd);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reap {
    Running,
    Exited(i32),
    /// Already reaped elsewhere (`ECHILD`).
    Gone,
}

fn reap(pid: i32, flags: i32) -> Reap {
    loop {
        let mut status = 0;
        // SAFETY: pid is a child of this process; status is a stack local.
        let ret = unsafe { libc::waitpid(pid, &mut status, flags) };
        if ret == pid {
            return Reap::Exited(status);
        }
        if ret == 0 {
            return Reap::Running;
        }
        if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Reap::Gone;
    }
}

fn wait_for_exit(pid: i32, timeout: Duration) -> Reap {
    let start = Instant::now();
    loop {
        match reap(pid, libc::WNOHANG) {
            Reap::Running if start.elapsed() < timeout => thread::sleep(EXIT_POLL_INTERVAL),
            outcome => return outcome,
        }
    }
}

fn terminate_child(pid: i32) -> Option<ExitReason> {
    if pid <= 0 {
        return None;
    }
    for signal in [libc::SIGHUP, libc::SIGTERM] {
        if let Err(err) = signal_process_group_or_pid(pid, signal, true) {
            debug!(pid, signal, error = %err, "graceful pty signal failed");
        }
    }
    match wait_for_exit(pid, TERMINATION_GRACE) {
        Reap::Exited(status) => return ExitReason::from_wait_status(status),
        Reap::Gone => return None,
        Reap::Running => {}
    }
    if let Err(err) = signal_process_group_or_pid(pid, libc::SIGKILL, true) {
        warn!(pid, error = %err, "SIGKILL to pty process group failed");
    }
    match reap(pid, 0) {
        Reap::Exited(status) => ExitReason::from_wait_status(status),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    fn sh(script: &str) -> PtyProcess {
        PtyProcess::new(LaunchSpec::new(["/bin/sh", "-c", script])).expect("spawn /bin/sh")
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = PtyProcess::new(LaunchSpec::new(Vec::<String>::new())).unwrap_err();
        assert!(matches!(err, ShellError::InvalidArgument(_)));
        assert!(matches!(
            PtyProcess::from_command_line("   "),
            Err(ShellError::InvalidArgument(_))
        ));
    }

    #[test]
    fn missing_program_fails_spawn() {
        let err = PtyProcess::from_command_line("/definitely/not/here --flag").unwrap_err();
        assert!(matches!(err, ShellError::ProcessSpawnFailed(_)), "{err}");
        let err = PtyProcess::from_command_line("shellpool-no-such-binary-xyz").unwrap_err();
        assert!(matches!(err, ShellError::ProcessSpawnFailed(_)), "{err}");
    }

    #[test]
    fn command_line_is_split_with_shell_quoting() {
        let spec = LaunchSpec::from_command_line("ssh -o 'ControlPath=/tmp/a b' host").unwrap();
        assert_eq!(spec.argv, vec!["ssh", "-o", "ControlPath=/tmp/a b", "host"]);
        assert_eq!(spec.display(), "ssh -o 'ControlPath=/tmp/a b' host");
    }

    #[test]
    fn find_returns_text_through_match_and_keeps_the_rest() {
        let mut process = sh("printf 'one\\ntwo\\nthree\\n'; sleep 5");
        let found = process
            .find(&["two\\n"], Timeout::After(Duration::from_secs(5)))
            .unwrap()
            .expect("pattern should match");
        assert_eq!(found.index, 0);
        assert_eq!(found.text, "one\ntwo\n");
        let rest = process
            .find(&["three\\n"], Timeout::After(Duration::from_secs(5)))
            .unwrap()
            .expect("remaining output stays cached");
        assert_eq!(rest.text, "three\n");
        process.finalize().unwrap();
    }

    #[test]
    fn find_prefers_list_order_over_position() {
        let mut process = sh("printf 'alpha beta\\n'; sleep 5");
        let found = process
            .find(&["beta", "alpha"], Timeout::After(Duration::from_secs(5)))
            .unwrap()
            .expect("match");
        assert_eq!(found.index, 0);
        assert_eq!(found.text, "alpha beta");
    }

    #[test]
    fn find_times_out_with_none() {
        let mut process = sh("sleep 5");
        let started = Instant::now();
        let found = process
            .find(&["never"], Timeout::After(Duration::from_millis(200)))
            .unwrap();
        assert!(found.is_none());
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(process.find(&["never"], Timeout::Poll).unwrap().is_none());
    }

    #[test]
    fn read_strips_carriage_returns_and_respects_max_size() {
        let mut process = sh("printf 'abcdef\\n'; sleep 5");
        let first = process.read(3, Timeout::After(Duration::from_secs(5))).unwrap();
        assert_eq!(first, "abc");
        let rest = process.read(100, Timeout::After(Duration::from_millis(300))).unwrap();
        assert_eq!(rest, "def\n");
    }

    #[test]
    fn write_reaches_the_child() {
        let mut process = PtyProcess::new(LaunchSpec::new(["/bin/cat"])).unwrap();
        process.write("ping\n").unwrap();
        let found = process
            .find(&["ping\\n.*ping\\n"], Timeout::After(Duration::from_secs(5)))
            .unwrap();
        // terminal echo plus cat's own copy
        assert!(found.is_some());
    }

    #[test]
    fn alive_reaps_and_records_exit_code() {
        let mut process = sh("exit 3");
        let pid = process.pid().unwrap();
        assert!(pid > 0);
        assert_eq!(process.wait(), Some(ExitReason::Code(3)));
        assert!(!process.alive(false));
        assert!(process.is_finalized());
        assert!(matches!(
            process.read(10, Timeout::Poll),
            Err(ShellError::ProcessDead(_))
        ));
        assert!(matches!(process.write("x"), Err(ShellError::ProcessDead(_))));
    }

    #[test]
    fn find_on_exited_child_reports_process_dead() {
        let mut process = sh("printf 'bye'");
        let err = process
            .find(&["never"], Timeout::Block)
            .expect_err("dead stream cannot block forever");
        assert!(matches!(err, ShellError::ProcessDead(_)));
        assert_eq!(process.cached(), "bye");
        assert_eq!(process.exit_reason(), Some(ExitReason::Code(0)));
    }

    #[test]
    fn finalize_kills_and_is_idempotent() {
        let mut process = sh("trap '' TERM; sleep 30");
        let pid = process.pid().expect("pid");
        assert!(process.alive(false));
        process.finalize().unwrap();
        process.finalize().unwrap();
        assert!(!process.alive(false));
        assert!(!crate::process_signal::process_exists(pid));
        assert!(process.exit_reason().and_then(ExitReason::signal).is_some());
    }

    #[test]
    fn alive_with_recover_starts_a_new_generation() {
        let mut process = sh("sleep 30");
        assert_eq!(process.generation(), 1);
        process.finalize().unwrap();
        assert!(process.alive(true));
        assert_eq!(process.generation(), 2);
        assert!(process.exit_reason().is_none());
    }

    #[test]
    fn hooks_run_on_spawn_and_teardown() {
        let spawned = Arc::new(AtomicUsize::new(0));
        let finalized = Arc::new(AtomicUsize::new(0));
        let hooks = ProcessHooks {
            on_initialize: Some(Box::new({
                let spawned = Arc::clone(&spawned);
                move |process: &mut PtyProcess| {
                    spawned.fetch_add(1, Ordering::SeqCst);
                    // quoted so the terminal echo of the command cannot match
                    process.write("echo rea''dy\n")
                }
            })),
            on_finalize: Some(Box::new({
                let finalized = Arc::clone(&finalized);
                move |_process: &mut PtyProcess| {
                    finalized.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })),
        };
        let mut process =
            PtyProcess::with_hooks(LaunchSpec::new(["/bin/sh"]), hooks).expect("spawn");
        assert_eq!(spawned.load(Ordering::SeqCst), 1);
        assert!(process
            .find(&["ready"], Timeout::After(Duration::from_secs(5)))
            .unwrap()
            .is_some());
        process.revive().unwrap();
        assert_eq!(spawned.load(Ordering::SeqCst), 2);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        drop(process);
        // drop clears hooks before tearing down
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn environment_overrides_and_term_reach_the_child() {
        let spec = LaunchSpec::new(["/bin/sh", "-c", "printf '%s/%s\\n' \"$SP_FLAVOR\" \"$TERM\"; sleep 5"])
            .env("SP_FLAVOR", "first")
            .env("SP_FLAVOR", "second")
            .term("vt100");
        let mut process = PtyProcess::new(spec).unwrap();
        let found = process
            .find(&["\\n"], Timeout::After(Duration::from_secs(5)))
            .unwrap()
            .expect("line");
        assert_eq!(found.text, "second/vt100\n");
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let mut process = sh("sleep 5");
        assert!(matches!(
            process.find(&["("], Timeout::Poll),
            Err(ShellError::InvalidArgument(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn find_then_read_reassembles_the_stream(
            head in "[a-z0-9 ]{0,40}",
            tail in "[a-z0-9 ]{1,40}",
        ) {
            let mut process = sh(&format!("printf '%s' '{head}MARK{tail}'; sleep 5"));
            let found = process
                .find(&["MARK"], Timeout::After(Duration::from_secs(5)))
                .unwrap()
                .expect("marker");
            let mut rest = String::new();
            while rest.len() < tail.len() {
                let wanted = tail.len() - rest.len();
                rest.push_str(&process.read(wanted, Timeout::After(Duration::from_secs(5))).unwrap());
            }
            prop_assert_eq!(format!("{}{rest}", found.text), format!("{head}MARK{tail}"));
        }
    }
}
