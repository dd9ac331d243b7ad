/// Tree-wide resource sampling for the watchdog
///
/// Two evidence sources, merged by [`crate::types::ResourceUsage::merge_max`]:
///
/// - the request's cgroup scope, when one exists (authoritative, survives
///   member exit);
/// - a /proc scan over the request's process group (works unprivileged,
///   misses nothing that is alive at the instant of the poll).
///
/// The final figures additionally take the `wait4` rusage of the direct
/// child as a floor, which covers descendants the child reaped itself.
use crate::cgroup::CgroupScope;
use crate::types::ResourceUsage;

use std::fs;
use std::path::Path;

/// Snapshot of the live members of one process group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupSample {
    /// utime+stime (+reaped-children time) over all live members, ms
    pub cpu_time_ms: u64,
    /// Sum of resident set sizes over all live members, bytes
    pub rss_bytes: u64,
    /// Live member count
    pub live_processes: u32,
}

/// Fields of /proc/<pid>/stat this monitor cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: u32,
    pub pgrp: i32,
    /// utime + stime + cutime + cstime, clock ticks
    pub cpu_ticks: u64,
    /// Resident set size, pages
    pub rss_pages: u64,
}

/// Parse one /proc/<pid>/stat line. The comm field may contain spaces and
/// parentheses, so splitting starts after the last ')'.
pub fn parse_proc_stat(line: &str) -> Option<ProcStat> {
    let pid: u32 = line.split(' ').next()?.parse().ok()?;
    let rest = &line[line.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // After comm: state=0 ppid=1 pgrp=2 ... utime=11 stime=12 cutime=13
    // cstime=14 ... rss=21
    if fields.len() < 22 {
        return None;
    }
    let pgrp: i32 = fields[2].parse().ok()?;
    let utime: u64 = fields[11].parse().ok()?;
    let stime: u64 = fields[12].parse().ok()?;
    let cutime: u64 = fields[13].parse().ok()?;
    let cstime: u64 = fields[14].parse().ok()?;
    let rss_pages: u64 = fields[21].parse().unwrap_or(0);
    Some(ProcStat {
        pid,
        pgrp,
        // A dead member's time lives in exactly one place at a time: its own
        // utime/stime while running, its reaper's cutime/cstime afterwards.
        cpu_ticks: utime + stime + cutime + cstime,
        rss_pages,
    })
}

pub struct TreeMonitor {
    pgid: i32,
    ticks_per_sec: u64,
    page_size: u64,
}

impl TreeMonitor {
    pub fn new(pgid: i32) -> Self {
        // SAFETY: sysconf is async-signal-safe and cannot fail for these names
        // on Linux; fall back to the conventional values regardless.
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Self {
            pgid,
            ticks_per_sec: if ticks > 0 { ticks as u64 } else { 100 },
            page_size: if page > 0 { page as u64 } else { 4096 },
        }
    }

    /// Walk /proc and sum usage over every live member of the group.
    pub fn sample_group(&self) -> GroupSample {
        let mut sample = GroupSample::default();
        let entries = match fs::read_dir("/proc") {
            Ok(e) => e,
            Err(_) => return sample,
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(n) if n.bytes().all(|b| b.is_ascii_digit()) => n,
                _ => continue,
            };
            let stat_line = match fs::read_to_string(entry.path().join("stat")) {
                Ok(s) => s,
                Err(_) => continue, // raced with exit
            };
            let stat = match parse_proc_stat(stat_line.trim_end()) {
                Some(s) => s,
                None => continue,
            };
            if stat.pgrp != self.pgid {
                continue;
            }
            debug_assert_eq!(stat.pid.to_string(), name);
            sample.live_processes += 1;
            sample.cpu_time_ms += stat.cpu_ticks * 1000 / self.ticks_per_sec;
            sample.rss_bytes += stat.rss_pages * self.page_size;
        }
        sample
    }

    /// Combined size of the stdout/stderr redirect targets.
    pub fn output_bytes(stdout: &Path, stderr: &Path) -> u64 {
        let len = |p: &Path| fs::metadata(p).map(|m| m.len()).unwrap_or(0);
        len(stdout) + len(stderr)
    }

    /// Merge the cgroup view and the /proc view into one usage observation.
    pub fn observe(&self, cgroup: Option<&CgroupScope>, stdout: &Path, stderr: &Path) -> ResourceUsage {
        let group = self.sample_group();
        let mut usage = ResourceUsage {
            cpu_time_ms: group.cpu_time_ms,
            real_time_ms: 0,
            peak_memory_bytes: group.rss_bytes,
            output_bytes: Self::output_bytes(stdout, stderr),
        };

        if let Some(cg) = cgroup {
            let cg_usage = ResourceUsage {
                cpu_time_ms: cg.cpu_time_ms().unwrap_or(0),
                real_time_ms: 0,
                peak_memory_bytes: cg.peak_memory_bytes().unwrap_or(0),
                output_bytes: 0,
            };
            usage.merge_max(&cg_usage);
        }

        usage
    }

    /// Whether any member of the group is still alive.
    pub fn group_alive(&self) -> bool {
        self.sample_group().live_processes > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_stat_line() {
        let line = "1234 (spin) R 1 1234 1000 0 -1 4194304 80 0 0 0 250 50 3 2 \
                    20 0 1 0 12345 10485760 512 18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 17 1 0 0";
        let stat = parse_proc_stat(line).unwrap();
        assert_eq!(stat.pid, 1234);
        assert_eq!(stat.pgrp, 1234);
        assert_eq!(stat.cpu_ticks, 250 + 50 + 3 + 2);
        assert_eq!(stat.rss_pages, 512);
    }

    #[test]
    fn parses_comm_with_spaces_and_parens() {
        let line = "77 (evil ) proc) S 1 42 42 0 -1 0 0 0 0 0 10 20 0 0 \
                    20 0 1 0 1 4096 8 184467440737 0 0 0 0 0 0 0 0 0 0 0 0 17 1 0 0";
        let stat = parse_proc_stat(line).unwrap();
        assert_eq!(stat.pid, 77);
        assert_eq!(stat.pgrp, 42);
        assert_eq!(stat.cpu_ticks, 30);
        assert_eq!(stat.rss_pages, 8);
    }

    #[test]
    fn rejects_truncated_line() {
        assert_eq!(parse_proc_stat("99 (x) R 1 99"), None);
        assert_eq!(parse_proc_stat(""), None);
        assert_eq!(parse_proc_stat("notanumber (x) R 1 99 99"), None);
    }

    #[test]
    fn samples_own_process_group() {
        // The test binary itself belongs to some process group; sampling that
        // group must find at least this process.
        let pgid = unsafe { libc::getpgid(0) };
        assert!(pgid > 0);
        let monitor = TreeMonitor::new(pgid);
        let sample = monitor.sample_group();
        assert!(sample.live_processes >= 1);
        assert!(sample.rss_bytes > 0);
    }

    #[test]
    fn output_bytes_sums_both_targets() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let err = dir.path().join("err");
        std::fs::write(&out, b"hello\n").unwrap();
        std::fs::write(&err, b"oops").unwrap();
        assert_eq!(TreeMonitor::output_bytes(&out, &err), 10);
        // Missing targets count as zero rather than erroring mid-poll.
        assert_eq!(
            TreeMonitor::output_bytes(&dir.path().join("gone"), &err),
            4
        );
    }
}
