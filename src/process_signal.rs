//! Signal delivery for supervised processes: group first, then the bare pid.

use std::io;
use std::time::Duration;
#[cfg(unix)]
use std::{thread, time::Instant};

#[cfg(unix)]
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Signal the process group led by `pid`, falling back to `pid` alone.
///
/// Redirected launches are group leaders, so the group signal also reaches
/// whatever the client forked. A pid that no longer exists counts as delivered.
#[cfg(unix)]
pub(crate) fn signal_group_then_pid(pid: i32, signal: i32) -> io::Result<()> {
    if pid <= 0 {
        return Ok(());
    }
    // SAFETY: `kill` takes plain integers and errno is read right after each call.
    let (group_err, pid_err) = unsafe {
        if libc::kill(-pid, signal) == 0 {
            return Ok(());
        }
        let group_err = io::Error::last_os_error();
        if libc::kill(pid, signal) == 0 {
            return Ok(());
        }
        (group_err, io::Error::last_os_error())
    };
    if pid_err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(io::Error::new(
        pid_err.kind(),
        format!("signal {signal} to group -{pid} ({group_err}) and pid {pid} ({pid_err}) failed"),
    ))
}

/// Whether `pid` still names a process, zombies included.
#[cfg(unix)]
pub fn process_exists(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks that the pid exists and may be signalled.
    let alive = unsafe { libc::kill(pid, 0) } == 0;
    alive || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_exists(_pid: i32) -> bool {
    false
}

/// SIGTERM `pid` (group first), wait up to `grace` for it to go away, then SIGKILL.
///
/// A process that exits but stays unreaped still counts as present, so callers
/// that own the child should reap it afterwards.
#[cfg(unix)]
pub fn terminate_with_escalation(pid: i32, grace: Duration) -> io::Result<()> {
    if pid <= 0 {
        return Ok(());
    }
    signal_group_then_pid(pid, libc::SIGTERM)?;
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !process_exists(pid) {
            return Ok(());
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
    signal_group_then_pid(pid, libc::SIGKILL)
}

#[cfg(not(unix))]
pub fn terminate_with_escalation(_pid: i32, _grace: Duration) -> io::Result<()> {
    Ok(())
}
