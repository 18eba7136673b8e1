//! Process-group signalling used when tearing down pty children.

use std::io;

/// Signal the process group rooted at `pid`, falling back to the pid itself.
///
/// Pty children call `setsid()`, so `-pid` also reaches anything they spawned
/// (an `ssh` under a shell, a pipeline inside a command). `missing_is_ok`
/// treats an already-vanished pid (`ESRCH`) as success.
pub(crate) fn signal_process_group_or_pid(
    pid: i32,
    signal: i32,
    missing_is_ok: bool,
) -> io::Result<()> {
    if pid <= 0 {
        return Ok(());
    }

    // SAFETY: kill only takes integer pid/signal values; errno is read right after
    // each call on this thread.
    unsafe {
        if libc::kill(-pid, signal) == 0 {
            return Ok(());
        }
        let group_err = io::Error::last_os_error();

        if libc::kill(pid, signal) == 0 {
            return Ok(());
        }
        let pid_err = io::Error::last_os_error();

        if missing_is_ok && is_no_such_process(&pid_err) {
            return Ok(());
        }

        Err(io::Error::new(
            pid_err.kind(),
            format!("signal {signal} to group(-{pid}) failed: {group_err}; to pid({pid}) failed: {pid_err}"),
        ))
    }
}

/// Probe whether `pid` still exists without delivering a signal.
#[cfg(test)]
pub(crate) fn process_exists(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks existence/permission.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    matches!(io::Error::last_os_error().raw_os_error(), Some(code) if code == libc::EPERM)
}

fn is_no_such_process(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(code) if code == libc::ESRCH)
}
