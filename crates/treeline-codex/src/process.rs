//! Process-group termination for the Codex child.
//!
//! The child is spawned in its own session/process group so that a single
//! signal reaches the grandchildren it spawns. SIGTERM first, then SIGKILL
//! after a grace period.

use std::time::Duration;
use tracing::debug;

/// SIGTERM the process group, wait `grace`, then SIGKILL.
///
/// Prefers `killpg` so the entire group (including grandchildren) is
/// signalled; falls back to a plain `kill` of the leader when group
/// signalling fails. Errors are ignored: the process may already be gone.
#[cfg(unix)]
pub async fn terminate_process_group(pid: u32, grace: Duration) {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let target = Pid::from_raw(raw);

    if killpg(target, Signal::SIGTERM).is_err() {
        let _ = kill(target, Signal::SIGTERM);
    }
    debug!(pid, "sent SIGTERM to process group");

    tokio::time::sleep(grace).await;

    if killpg(target, Signal::SIGKILL).is_err() {
        let _ = kill(target, Signal::SIGKILL);
    }
    debug!(pid, "sent SIGKILL to process group");
}

#[cfg(not(unix))]
pub async fn terminate_process_group(_pid: u32, _grace: Duration) {}
