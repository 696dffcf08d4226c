use std::collections::BTreeMap;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use protocol::{Operation, OutputFormat};

use crate::builder::CommandDescriptor;
use crate::jobs::{JobLimits, JobRegistry};
use crate::runner::{ProcessRunner, RunnerLimits};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn temp_dir(prefix: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    dir.push(format!("{prefix}-{nanos}-{seq}"));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Writes an executable `/bin/sh` script named `name` into `dir`.
pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    fs::create_dir_all(dir).expect("create script dir");
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    let mut perms = fs::metadata(&path).expect("script metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod script");
    path
}

pub(crate) fn block_on<F: Future>(future: F) -> F::Output {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    rt.block_on(future)
}

/// True while `pid` names a running process. A zombie still accepts
/// signals but counts as dead; so does a pid whose `/proc` entry is gone.
pub(crate) fn process_alive(pid: u32) -> bool {
    if unsafe { libc::kill(pid as i32, 0) } != 0 {
        return false;
    }
    if !Path::new("/proc/self/stat").exists() {
        return true;
    }
    !matches!(process_state(pid), None | Some('Z'))
}

/// Single-letter state from `/proc/<pid>/stat`, e.g. `R`, `S` or `Z`.
pub(crate) fn process_state(pid: u32) -> Option<char> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let (_, rest) = stat.rsplit_once(')')?;
    rest.trim_start().chars().next()
}

/// A `build` descriptor that runs `script` under `/bin/sh -c`.
pub(crate) fn sh(script: &str) -> CommandDescriptor {
    CommandDescriptor {
        operation: Operation::Build,
        program: PathBuf::from("/bin/sh"),
        args: vec!["-c".to_string(), script.to_string()],
        cwd: None,
        env: BTreeMap::new(),
        timeout: Duration::from_secs(30),
        format: OutputFormat::Plain,
    }
}

pub(crate) fn test_registry(limits: JobLimits) -> JobRegistry {
    let runner = ProcessRunner::new(RunnerLimits {
        grace: Duration::from_millis(500),
        ..RunnerLimits::default()
    });
    JobRegistry::new(runner, limits, None)
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn unreaped_child_is_not_alive() {
        let mut child = std::process::Command::new("/bin/sh")
            .args(["-c", "exit 0"])
            .spawn()
            .expect("spawn");
        let pid = child.id();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while process_state(pid) != Some('Z') && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(process_state(pid), Some('Z'));
        assert!(!process_alive(pid));
        child.wait().expect("reap");
        assert!(!process_alive(pid));
    }

    #[test]
    fn running_process_is_alive() {
        let mut child = std::process::Command::new("/bin/sh")
            .args(["-c", "sleep 5"])
            .spawn()
            .expect("spawn");
        assert!(process_alive(child.id()));
        child.kill().expect("kill");
        child.wait().expect("reap");
    }
}
