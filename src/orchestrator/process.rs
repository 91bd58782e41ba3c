//! OS process liveness probing and termination signals.

use tracing::warn;

/// Answers whether a process id still exists.
pub trait ProcessProbe: Send + Sync {
    /// `true` if the process exists (including when we lack permission to signal it).
    fn is_alive(&self, pid: i64) -> bool;
}

/// Probe backed by `kill(pid, 0)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcessProbe;

impl ProcessProbe for OsProcessProbe {
    fn is_alive(&self, pid: i64) -> bool {
        is_alive(pid)
    }
}

/// Convert a stored pid to a signalable one; rejects 0 and negatives, which
/// would address process groups.
#[cfg(unix)]
fn to_pid(pid: i64) -> Option<nix::unistd::Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(nix::unistd::Pid::from_raw)
}

/// Whether `pid` names a live process.
#[cfg(unix)]
#[must_use]
pub fn is_alive(pid: i64) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    let Some(pid) = to_pid(pid) else {
        return false;
    };
    match kill(pid, None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Whether `pid` names a live process.
///
/// Without a portable probe the process is assumed alive; the detector then
/// only reports it.
#[cfg(not(unix))]
#[must_use]
pub fn is_alive(_pid: i64) -> bool {
    true
}

/// Send `SIGTERM` to `pid`. Returns `false` if the process was already gone.
#[cfg(unix)]
pub fn terminate(pid: i64) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};

    let Some(target) = to_pid(pid) else {
        warn!(pid, "refusing to signal invalid pid");
        return false;
    };
    match kill(target, Signal::SIGTERM) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(err) => {
            warn!(pid, %err, "failed to signal process");
            false
        }
    }
}

/// Send a termination request to `pid`.
#[cfg(not(unix))]
pub fn terminate(pid: i64) -> bool {
    warn!(pid, "process signalling is not supported on this platform");
    false
}
