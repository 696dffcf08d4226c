use protocol::SystemInfo;
use std::env::consts;

/// Read-only host facts, queried on demand.
pub trait SystemInfoProvider: Send + Sync {
    fn system_info(&self) -> SystemInfo;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HostInfo;

impl SystemInfoProvider for HostInfo {
    fn system_info(&self) -> SystemInfo {
        SystemInfo {
            os: consts::OS.to_string(),
            family: consts::FAMILY.to_string(),
            arch: consts::ARCH.to_string(),
            cpus: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            hostname: hostname(),
            total_memory_bytes: total_memory_bytes(),
        }
    }
}

#[cfg(unix)]
fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).into_owned();
    (!name.is_empty()).then_some(name)
}

#[cfg(not(unix))]
fn hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

fn total_memory_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_mem_total(&meminfo)
}

fn parse_mem_total(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|line| line.starts_with("MemTotal:"))?;
    let mut parts = line.split_whitespace().skip(1);
    let value: u64 = parts.next()?.parse().ok()?;
    match parts.next() {
        Some("kB") | None => Some(value * 1024),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_meminfo() {
        let sample = "MemTotal:       16318484 kB\nMemFree:         1234 kB\n";
        assert_eq!(parse_mem_total(sample), Some(16318484 * 1024));
        assert_eq!(parse_mem_total("MemFree: 1 kB\n"), None);
    }

    #[test]
    fn host_info_reports_build_target() {
        let info = HostInfo.system_info();
        assert_eq!(info.os, consts::OS);
        assert_eq!(info.arch, consts::ARCH);
        assert!(info.cpus >= 1);
    }
}
