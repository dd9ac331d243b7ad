/// Per-request orchestration: validate → launch → watch → reap → classify
///
/// One `SandboxExecutor` serves many requests, but every request gets fresh
/// state: its own cgroup scope, its own process group, its own watchdog and
/// cause cell. Nothing here is ambient or shared across requests, so limits
/// can never leak from one execution into the next.
use crate::cgroup::CgroupScope;
use crate::classifier::{self, TerminationFacts};
use crate::launcher::{self, PROCESS_BACKSTOP};
use crate::monitor::TreeMonitor;
use crate::request::{self, RawRequest};
use crate::types::{ExecutionRequest, ExecutionResult, ResourceUsage, Result, SandboxError};
use crate::watchdog::{self, Watchdog};

use std::io;
use std::mem;
use std::sync::Arc;

pub struct SandboxExecutor {
    /// Fail hard when cgroup accounting is unavailable instead of degrading
    /// to /proc-scan accounting.
    strict: bool,
}

impl SandboxExecutor {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// Validate and run one raw request end to end.
    pub fn execute_raw(&self, raw: RawRequest) -> Result<ExecutionResult> {
        let req = request::validate(raw)?;
        self.execute(&req)
    }

    /// Run one validated request to completion or forcible termination.
    pub fn execute(&self, req: &ExecutionRequest) -> Result<ExecutionResult> {
        let cgroup = self.create_scope(req)?;

        let tree = launcher::spawn(req, cgroup.as_deref())?;
        let pgid = tree.pgid();
        let monitor = TreeMonitor::new(pgid);

        let watchdog = match Watchdog::arm(req, pgid, cgroup.clone()) {
            Ok(w) => w,
            Err(e) => {
                // A tree without a watchdog over it must not keep running.
                watchdog::kill_group(pgid);
                let _ = wait_for(tree.pid as i32);
                watchdog::reap_group(pgid, &monitor, cgroup.as_deref())?;
                return Err(e);
            }
        };

        let wait = wait_for(tree.pid as i32);
        let real_time_ms = tree.started.elapsed().as_millis() as u64;

        let (observed, kill_cause) = watchdog.disarm();

        // The group must be fully drained before the result is finalized,
        // even on the fork-bomb path. This is the one fatal failure mode.
        // The leader is already reaped here, so the reaper only signals the
        // group while live members remain; a blanket killpg at this point
        // could hit a recycled group id.
        watchdog::reap_group(pgid, &monitor, cgroup.as_deref())?;

        let wait = wait?;

        let mut usage = observed;
        usage.merge_max(&wait.usage);
        usage.real_time_ms = real_time_ms;
        if let Some(cg) = cgroup.as_deref() {
            usage.merge_max(&ResourceUsage {
                cpu_time_ms: cg.cpu_time_ms().unwrap_or(0),
                real_time_ms: 0,
                peak_memory_bytes: cg.peak_memory_bytes().unwrap_or(0),
                output_bytes: 0,
            });
        }
        usage.output_bytes = usage
            .output_bytes
            .max(TreeMonitor::output_bytes(&req.stdout, &req.stderr));

        let facts = TerminationFacts {
            exit_code: wait.exit_code,
            signal: wait.signal,
            kill_cause,
            oom_killed: cgroup.as_deref().map(|cg| cg.oom_killed()).unwrap_or(false),
            usage,
        };

        let outcome = classifier::classify(req, &facts);
        log::debug!(
            "pgid={} outcome={:?} cpu={}ms real={}ms mem={}B out={}B",
            pgid,
            outcome,
            usage.cpu_time_ms,
            usage.real_time_ms,
            usage.peak_memory_bytes,
            usage.output_bytes
        );

        if let Some(cg) = cgroup {
            let _ = cg.cleanup();
        }

        Ok(classifier::into_result(&facts, outcome))
    }

    /// Build the per-request accounting scope, or degrade per policy.
    fn create_scope(&self, req: &ExecutionRequest) -> Result<Option<Arc<CgroupScope>>> {
        if !CgroupScope::available() {
            if self.strict {
                return Err(SandboxError::Cgroup(
                    "cgroups required for tree-wide accounting in strict mode".to_string(),
                ));
            }
            log::warn!("cgroups unavailable; falling back to /proc-scan accounting");
            return Ok(None);
        }

        let name = format!("runbox-{}", uuid::Uuid::new_v4());
        match CgroupScope::create(&name) {
            Ok(scope) => {
                scope.apply_limits(req.max_memory, PROCESS_BACKSTOP)?;
                Ok(Some(Arc::new(scope)))
            }
            Err(e) if self.strict => Err(e),
            Err(e) => {
                log::warn!("cgroup scope creation failed, degrading: {}", e);
                Ok(None)
            }
        }
    }
}

struct WaitFacts {
    exit_code: Option<i32>,
    signal: Option<i32>,
    /// Direct child's rusage: CPU floor plus maxrss for the fallback path.
    usage: ResourceUsage,
}

/// Blocking wait on the direct child, with per-child rusage. Descendants the
/// child reaped itself are included in the rusage figures; descendants it
/// abandoned are covered by the watchdog's live samples instead.
fn wait_for(pid: i32) -> Result<WaitFacts> {
    let mut status: libc::c_int = 0;
    // SAFETY: zeroed rusage is a valid initial value for wait4 to fill.
    let mut ru: libc::rusage = unsafe { mem::zeroed() };

    loop {
        let ret = unsafe { libc::wait4(pid, &mut status, 0, &mut ru) };
        if ret == pid {
            break;
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(SandboxError::Monitor(format!("wait4 failed: {}", err)));
    }

    let (exit_code, signal) = if libc::WIFEXITED(status) {
        (Some(libc::WEXITSTATUS(status)), None)
    } else if libc::WIFSIGNALED(status) {
        (None, Some(libc::WTERMSIG(status)))
    } else {
        (None, None)
    };

    let timeval_ms =
        |tv: libc::timeval| (tv.tv_sec as u64) * 1000 + (tv.tv_usec as u64) / 1000;

    Ok(WaitFacts {
        exit_code,
        signal,
        usage: ResourceUsage {
            cpu_time_ms: timeval_ms(ru.ru_utime) + timeval_ms(ru.ru_stime),
            real_time_ms: 0,
            // ru_maxrss is KiB on Linux.
            peak_memory_bytes: (ru.ru_maxrss as u64) * 1024,
            output_bytes: 0,
        },
    })
}
