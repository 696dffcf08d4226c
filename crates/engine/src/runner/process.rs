use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::{Child, Command};

/// Puts the child in its own session so the whole tree can be signalled.
#[cfg(unix)]
pub(super) fn apply_process_group(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub(super) fn apply_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn signal_group(child: &Child, signal: i32) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _signal: i32) {}

#[cfg(unix)]
const SIGTERM: i32 = libc::SIGTERM;
#[cfg(unix)]
const SIGKILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

/// Resolves once the leader has exited. On unix the leader is left as a
/// zombie, so its pid and the group id stay reserved until [`reap_child`].
#[cfg(unix)]
pub(super) async fn leader_exit(child: &mut Child) -> io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    tokio::task::spawn_blocking(move || wait_exited(pid))
        .await
        .map_err(io::Error::other)?
}

#[cfg(unix)]
fn wait_exited(pid: u32) -> io::Result<()> {
    loop {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
pub(super) async fn leader_exit(child: &mut Child) -> io::Result<()> {
    child.wait().await.map(|_| ())
}

/// SIGTERM to the group, then SIGKILL once `grace` runs out. Leaves the
/// leader for [`reap_child`].
pub(super) async fn terminate_child(child: &mut Child, grace: Duration) {
    signal_group(child, SIGTERM);
    if tokio::time::timeout(grace, leader_exit(child)).await.is_ok() {
        return;
    }
    signal_group(child, SIGKILL);
    let _ = child.start_kill();
    let _ = tokio::time::timeout(grace.max(Duration::from_secs(1)), leader_exit(child)).await;
}

/// Kills whatever is left of the group, then reaps the leader. Must run
/// before the leader is reaped anywhere else.
pub(super) async fn reap_child(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    signal_group(child, SIGKILL);
    match tokio::time::timeout(grace.max(Duration::from_secs(1)), child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => None,
    }
}
