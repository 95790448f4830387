//! SIGINT/SIGTERM handling so an interrupted `runsup` kills its runs before exiting.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};

/// Flag set by the shutdown handler; the control loop polls it.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Only touches an atomic (async-signal-safe).
#[cfg(unix)]
extern "C" fn handle_shutdown(_: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
pub(crate) fn install_shutdown_handler() -> Result<()> {
    use anyhow::anyhow;
    for signal in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only stores to an atomic flag. `sigemptyset` and
        // `sigaction` get initialized pointers and their results are checked.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_flags = libc::SA_RESTART;
            action.sa_sigaction = handle_shutdown as *const () as usize;
            if libc::sigemptyset(&mut action.sa_mask) != 0 {
                return Err(anyhow!("failed to clear signal mask"));
            }
            if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                return Err(anyhow!("failed to install handler for signal {signal}"));
            }
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn install_shutdown_handler() -> Result<()> {
    Ok(())
}

pub(crate) fn take_shutdown() -> bool {
    SHUTDOWN_REQUESTED.swap(false, Ordering::SeqCst)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn sigterm_sets_the_flag_once() {
        SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
        install_shutdown_handler().expect("install handler");
        // SAFETY: raising SIGTERM in-process with our handler installed only sets the flag.
        unsafe {
            libc::raise(libc::SIGTERM);
        }
        for _ in 0..20 {
            if take_shutdown() {
                assert!(!take_shutdown());
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("SIGTERM was not received");
    }
}
