//! Pseudo-terminal child processes: spawn, read with timeouts, pattern search,
//! liveness with optional revival, and graceful-then-forceful teardown.

mod io;
mod pty;
mod timeout;

pub(crate) use pty::compile_pattern;
pub use pty::{
    ExitReason, FindMatch, LaunchSpec, ProcessHook, ProcessHooks, PtyProcess, MAX_REVIVE_ATTEMPTS,
};
pub use timeout::Timeout;
