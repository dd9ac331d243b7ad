/// Outcome classification: deterministic mapping from termination facts
///
/// Pure function over observed facts, no I/O. Precedence is fixed because
/// wall-clock safety is the host-protection priority: a run that blew its
/// real-time budget is REAL_TIME_LIMIT_EXCEEDED even if CPU or memory were
/// also at their ceilings when the kill landed.
use crate::types::{ExecutionRequest, ExecutionResult, Outcome, ResourceUsage};
use crate::watchdog::KillCause;

/// Raw facts about how one sandboxed tree terminated.
#[derive(Clone, Copy, Debug)]
pub struct TerminationFacts {
    /// Exit code if the direct child exited normally
    pub exit_code: Option<i32>,
    /// Terminating signal otherwise
    pub signal: Option<i32>,
    /// Cause recorded by the watchdog, if it was the killer
    pub kill_cause: Option<KillCause>,
    /// Kernel OOM kill observed in the request's accounting scope
    pub oom_killed: bool,
    /// Final merged usage figures
    pub usage: ResourceUsage,
}

/// Classify one execution. First match wins:
///
/// 1. real time at/over ceiling
/// 2. CPU time at/over ceiling, or a terminating SIGXCPU from the
///    kernel's CPU rlimit
/// 3. peak memory at/over ceiling, or an OOM kill
/// 4. output bytes at/over ceiling
/// 5. a watchdog kill whose measured figure slipped under the ceiling
///    between detection and sampling (classified by the recorded cause)
/// 6. killed by an unrelated signal, or nonzero exit
/// 7. success
pub fn classify(req: &ExecutionRequest, facts: &TerminationFacts) -> Outcome {
    let usage = &facts.usage;

    if usage.real_time_ms >= req.max_real_time {
        return Outcome::RealTimeLimitExceeded;
    }
    // SIGXCPU is the kernel's own CPU-ceiling verdict. The rlimit fires at
    // exactly the ceiling, so the rusage figure can land a tick under it.
    if usage.cpu_time_ms >= req.max_cpu_time.saturating_mul(1000)
        || facts.signal == Some(libc::SIGXCPU)
    {
        return Outcome::CpuTimeLimitExceeded;
    }
    if usage.peak_memory_bytes >= req.max_memory || facts.oom_killed {
        return Outcome::MemoryLimitExceeded;
    }
    if usage.output_bytes >= req.max_output_size {
        return Outcome::OutputLimitExceeded;
    }

    if let Some(cause) = facts.kill_cause {
        return match cause {
            KillCause::RealTime => Outcome::RealTimeLimitExceeded,
            KillCause::CpuTime => Outcome::CpuTimeLimitExceeded,
            KillCause::Memory => Outcome::MemoryLimitExceeded,
            KillCause::Output => Outcome::OutputLimitExceeded,
        };
    }

    if facts.signal.is_some() {
        return Outcome::RuntimeError;
    }
    match facts.exit_code {
        Some(0) => Outcome::Success,
        Some(_) => Outcome::RuntimeError,
        // No exit code and no signal should be unreachable out of wait4;
        // treat it as the target having died abnormally.
        None => Outcome::RuntimeError,
    }
}

/// Assemble the caller-visible result from the facts and their outcome.
pub fn into_result(facts: &TerminationFacts, outcome: Outcome) -> ExecutionResult {
    ExecutionResult {
        exit_code: facts.exit_code,
        signal: facts.signal,
        cpu_time_used_ms: facts.usage.cpu_time_ms,
        real_time_used_ms: facts.usage.real_time_ms,
        peak_memory_bytes: facts.usage.peak_memory_bytes,
        output_bytes_written: facts.usage.output_bytes,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            bin: PathBuf::from("/bin/true"),
            uid: None,
            gid: None,
            stdin: PathBuf::from("/dev/null"),
            stdout: PathBuf::from("/tmp/out"),
            stderr: PathBuf::from("/tmp/err"),
            max_real_time: 1000,
            max_cpu_time: 1,
            max_memory: 1024 * 1024,
            max_output_size: 4096,
        }
    }

    fn facts(usage: ResourceUsage) -> TerminationFacts {
        TerminationFacts {
            exit_code: Some(0),
            signal: None,
            kill_cause: None,
            oom_killed: false,
            usage,
        }
    }

    #[test]
    fn clean_exit_within_limits_is_success() {
        let f = facts(ResourceUsage {
            cpu_time_ms: 50,
            real_time_ms: 80,
            peak_memory_bytes: 4096,
            output_bytes: 6,
        });
        assert_eq!(classify(&request(), &f), Outcome::Success);
    }

    #[test]
    fn nonzero_exit_is_runtime_error() {
        let mut f = facts(ResourceUsage::default());
        f.exit_code = Some(1);
        assert_eq!(classify(&request(), &f), Outcome::RuntimeError);
    }

    #[test]
    fn unrelated_signal_is_runtime_error() {
        let mut f = facts(ResourceUsage::default());
        f.exit_code = None;
        f.signal = Some(libc::SIGSEGV);
        assert_eq!(classify(&request(), &f), Outcome::RuntimeError);
    }

    #[test]
    fn real_time_outranks_everything() {
        // Every figure over its ceiling at once: wall clock must win.
        let mut f = facts(ResourceUsage {
            cpu_time_ms: 5000,
            real_time_ms: 1500,
            peak_memory_bytes: 64 * 1024 * 1024,
            output_bytes: 1 << 20,
        });
        f.exit_code = None;
        f.signal = Some(libc::SIGKILL);
        f.kill_cause = Some(KillCause::RealTime);
        f.oom_killed = true;
        assert_eq!(classify(&request(), &f), Outcome::RealTimeLimitExceeded);
    }

    #[test]
    fn cpu_outranks_memory_and_output() {
        let f = facts(ResourceUsage {
            cpu_time_ms: 1000,
            real_time_ms: 900,
            peak_memory_bytes: 2 * 1024 * 1024,
            output_bytes: 8192,
        });
        assert_eq!(classify(&request(), &f), Outcome::CpuTimeLimitExceeded);
    }

    #[test]
    fn cpu_limit_is_inclusive_at_the_boundary() {
        let f = facts(ResourceUsage {
            cpu_time_ms: 1000, // exactly max_cpu_time * 1000
            real_time_ms: 500,
            peak_memory_bytes: 0,
            output_bytes: 0,
        });
        assert_eq!(classify(&request(), &f), Outcome::CpuTimeLimitExceeded);
    }

    #[test]
    fn oom_kill_counts_as_memory_evidence() {
        // Peak figure under the ceiling, but the kernel OOM-killed the tree.
        let mut f = facts(ResourceUsage {
            cpu_time_ms: 10,
            real_time_ms: 20,
            peak_memory_bytes: 512 * 1024,
            output_bytes: 0,
        });
        f.exit_code = None;
        f.signal = Some(libc::SIGKILL);
        f.oom_killed = true;
        assert_eq!(classify(&request(), &f), Outcome::MemoryLimitExceeded);
    }

    #[test]
    fn little_cpu_little_time_big_memory_is_mle() {
        // The mle scenario: tiny ceiling, everything else nominal.
        let mut req = request();
        req.max_memory = 10000;
        let f = facts(ResourceUsage {
            cpu_time_ms: 5,
            real_time_ms: 15,
            peak_memory_bytes: 10000,
            output_bytes: 0,
        });
        assert_eq!(classify(&req, &f), Outcome::MemoryLimitExceeded);
    }

    #[test]
    fn sleeper_past_deadline_is_real_not_cpu() {
        // The real_tle scenario: blocked in sleep, zero CPU progress.
        let mut f = facts(ResourceUsage {
            cpu_time_ms: 2,
            real_time_ms: 1000,
            peak_memory_bytes: 4096,
            output_bytes: 0,
        });
        f.exit_code = None;
        f.signal = Some(libc::SIGKILL);
        f.kill_cause = Some(KillCause::RealTime);
        assert_eq!(classify(&request(), &f), Outcome::RealTimeLimitExceeded);
    }

    #[test]
    fn output_at_ceiling_is_ole() {
        let f = facts(ResourceUsage {
            cpu_time_ms: 5,
            real_time_ms: 10,
            peak_memory_bytes: 4096,
            output_bytes: 4096,
        });
        assert_eq!(classify(&request(), &f), Outcome::OutputLimitExceeded);
    }

    #[test]
    fn watchdog_cause_backstops_measurement_jitter() {
        // The kill fired but the final sample landed just under the ceiling;
        // the recorded cause still decides, and a watchdog SIGKILL is never
        // misread as a runtime error.
        let mut f = facts(ResourceUsage {
            cpu_time_ms: 990,
            real_time_ms: 700,
            peak_memory_bytes: 4096,
            output_bytes: 0,
        });
        f.exit_code = None;
        f.signal = Some(libc::SIGKILL);
        f.kill_cause = Some(KillCause::CpuTime);
        assert_eq!(classify(&request(), &f), Outcome::CpuTimeLimitExceeded);
    }

    #[test]
    fn kernel_sigxcpu_is_cpu_tle_even_when_rusage_lands_under() {
        // RLIMIT_CPU delivers SIGXCPU at the ceiling; the recorded figure can
        // be a tick short of max_cpu_time * 1000 and no watchdog cause exists.
        let mut f = facts(ResourceUsage {
            cpu_time_ms: 992,
            real_time_ms: 995,
            peak_memory_bytes: 4096,
            output_bytes: 0,
        });
        f.exit_code = None;
        f.signal = Some(libc::SIGXCPU);
        assert_eq!(classify(&request(), &f), Outcome::CpuTimeLimitExceeded);
    }

    #[test]
    fn classification_is_deterministic() {
        let f = facts(ResourceUsage {
            cpu_time_ms: 40,
            real_time_ms: 60,
            peak_memory_bytes: 8192,
            output_bytes: 12,
        });
        let req = request();
        let first = classify(&req, &f);
        for _ in 0..10 {
            assert_eq!(classify(&req, &f), first);
        }
    }

    #[test]
    fn result_carries_usage_figures() {
        let f = facts(ResourceUsage {
            cpu_time_ms: 40,
            real_time_ms: 60,
            peak_memory_bytes: 8192,
            output_bytes: 12,
        });
        let result = into_result(&f, Outcome::Success);
        assert_eq!(result.cpu_time_used_ms, 40);
        assert_eq!(result.real_time_used_ms, 60);
        assert_eq!(result.peak_memory_bytes, 8192);
        assert_eq!(result.output_bytes_written, 12);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.signal, None);
    }
}
