/// Per-request cgroup v1 scope for tree-wide resource accounting
///
/// One `CgroupScope` per request, named by a fresh UUID so sequential or
/// concurrent requests can never share an accounting scope. Limits registered
/// here bind every process the target forks, which is what defeats the
/// fork-to-spread-consumption trick; rlimits alone only bind one process.
use crate::types::{Result, SandboxError};

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

const CGROUP_BASE: &str = "/sys/fs/cgroup";

/// Controllers this scope uses: memory for the tree-wide ceiling and OOM
/// evidence, pids for the fork-bomb backstop, cpuacct for cumulative CPU.
const CONTROLLERS: [&str; 3] = ["memory", "pids", "cpuacct"];

pub struct CgroupScope {
    name: String,
    paths: std::collections::HashMap<String, PathBuf>,
}

impl CgroupScope {
    /// Whether cgroup v1 accounting can be used at all on this host.
    pub fn available() -> bool {
        Path::new("/proc/cgroups").exists() && Path::new(CGROUP_BASE).exists()
    }

    /// Create the per-request scope directories. Returns an error if no
    /// controller could be created; the caller decides whether that is fatal
    /// (strict mode) or degrades to /proc-based accounting.
    pub fn create(name: &str) -> Result<Self> {
        let enabled = enabled_controllers()?;
        let mut paths = std::collections::HashMap::new();
        let mut errors = Vec::new();

        for controller in CONTROLLERS {
            if !enabled.contains(controller) {
                continue;
            }
            let path = Path::new(CGROUP_BASE).join(controller).join(name);
            match fs::create_dir_all(&path) {
                Ok(_) => {
                    paths.insert(controller.to_string(), path);
                }
                Err(e) => errors.push(format!("{}: {}", controller, e)),
            }
        }

        if paths.is_empty() {
            return Err(SandboxError::Cgroup(format!(
                "no usable controllers for scope {}: {:?}",
                name, errors
            )));
        }
        if !errors.is_empty() {
            log::warn!("scope {}: some controllers unavailable: {:?}", name, errors);
        }

        Ok(Self {
            name: name.to_string(),
            paths,
        })
    }

    /// Register the request's memory ceiling and the process-count backstop.
    /// Called before the target is attached, so the limits already hold the
    /// moment the first member joins.
    pub fn apply_limits(&self, max_memory: u64, max_pids: u32) -> Result<()> {
        if let Some(memory) = self.paths.get("memory") {
            write_value(&memory.join("memory.limit_in_bytes"), max_memory)?;
            // Cap swap too where the hierarchy supports it, or the ceiling is
            // trivially dodged by swapping.
            let memsw = memory.join("memory.memsw.limit_in_bytes");
            if memsw.exists() {
                let _ = fs::write(&memsw, max_memory.to_string());
            }
            let swappiness = memory.join("memory.swappiness");
            if swappiness.exists() {
                let _ = fs::write(&swappiness, "0");
            }
        }

        if let Some(pids) = self.paths.get("pids") {
            write_value(&pids.join("pids.max"), max_pids)?;
        }

        Ok(())
    }

    /// `cgroup.procs` files for every controller in this scope. The launcher
    /// writes "0" into these from inside the child, between fork and exec,
    /// so membership binds before the target's first instruction.
    pub fn procs_paths(&self) -> Vec<PathBuf> {
        self.paths.values().map(|p| p.join("cgroup.procs")).collect()
    }

    /// Cumulative CPU time of every member, live or dead, in milliseconds.
    pub fn cpu_time_ms(&self) -> Option<u64> {
        let path = self.paths.get("cpuacct")?.join("cpuacct.usage");
        read_value::<u64>(&path).map(|ns| ns / 1_000_000)
    }

    /// Peak resident memory across the tree, in bytes.
    pub fn peak_memory_bytes(&self) -> Option<u64> {
        let path = self.paths.get("memory")?.join("memory.max_usage_in_bytes");
        read_value(&path)
    }

    /// Whether the kernel OOM killer fired inside this scope. Equivalent
    /// evidence to the memory detector tripping.
    pub fn oom_killed(&self) -> bool {
        let memory = match self.paths.get("memory") {
            Some(p) => p,
            None => return false,
        };

        if let Ok(oom_control) = fs::read_to_string(memory.join("memory.oom_control")) {
            if oom_control.contains("under_oom 1") {
                return true;
            }
        }

        if let Ok(stat) = fs::read_to_string(memory.join("memory.stat")) {
            for line in stat.lines() {
                if let Some(count) = line.strip_prefix("oom_kill ") {
                    if count.trim().parse::<u64>().map(|n| n > 0).unwrap_or(false) {
                        return true;
                    }
                }
            }
        }

        false
    }

    /// Pids still listed as members of the scope.
    pub fn live_members(&self) -> Vec<u32> {
        let mut pids = Vec::new();
        for path in self.paths.values() {
            if let Ok(content) = fs::read_to_string(path.join("cgroup.procs")) {
                for line in content.lines() {
                    if let Ok(pid) = line.trim().parse::<u32>() {
                        if !pids.contains(&pid) {
                            pids.push(pid);
                        }
                    }
                }
            }
        }
        pids
    }

    /// SIGKILL everything still in the scope until the member list drains.
    /// This is the cgroup-backed half of the tree-wide reap contract.
    pub fn kill_remaining(&self, attempts: u32) -> Result<()> {
        for _ in 0..attempts {
            let members = self.live_members();
            if members.is_empty() {
                return Ok(());
            }
            for pid in &members {
                let _ = kill(Pid::from_raw(*pid as i32), Signal::SIGKILL);
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let leftover = self.live_members();
        if leftover.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::Cgroup(format!(
                "scope {} still has live members: {:?}",
                self.name, leftover
            )))
        }
    }

    /// Remove the scope directories. Members must already be gone.
    pub fn cleanup(&self) -> Result<()> {
        let mut errors = Vec::new();
        for (controller, path) in &self.paths {
            if path.exists() {
                if let Err(e) = fs::remove_dir(path) {
                    errors.push(format!("{}: {}", controller, e));
                }
            }
        }
        if !errors.is_empty() {
            // Leftover empty directories are hygiene, not a safety problem.
            log::warn!("scope {} cleanup incomplete: {:?}", self.name, errors);
        }
        Ok(())
    }
}

impl Drop for CgroupScope {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

fn enabled_controllers() -> Result<HashSet<String>> {
    let content = fs::read_to_string("/proc/cgroups")
        .map_err(|e| SandboxError::Cgroup(format!("failed to read /proc/cgroups: {}", e)))?;

    let mut controllers = HashSet::new();
    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 4 && parts[3] == "1" {
            controllers.insert(parts[0].to_string());
        }
    }
    Ok(controllers)
}

fn write_value(path: &Path, value: impl std::fmt::Display) -> Result<()> {
    fs::write(path, value.to_string()).map_err(|e| {
        SandboxError::Cgroup(format!("failed to write {}: {}", path.display(), e))
    })
}

fn read_value<T: std::str::FromStr>(path: &Path) -> Option<T> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}
