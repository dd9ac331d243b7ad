/// Resource watchdog: race four detectors against the running tree
///
/// The watchdog thread is the sole authority on when and why the tree is
/// killed. Four logically independent detectors share one `select!` loop:
///
/// - real-time: a deadline channel armed at launch; fires even when the tree
///   consumes no CPU at all (a process parked in `sleep`)
/// - CPU-time: cumulative over every member, from the cgroup scope or the
///   /proc group scan
/// - memory: tree-wide peak RSS, with a kernel OOM kill counting as
///   equivalent evidence
/// - output: combined size of the stdout/stderr redirect targets
///
/// Whichever fires first wins the [`CauseCell`] and kills the whole process
/// group; later detectors can no longer change the recorded cause.
use crate::cgroup::CgroupScope;
use crate::monitor::TreeMonitor;
use crate::types::{ExecutionRequest, ResourceUsage};

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{after, bounded, select, tick, Sender};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

/// How often the polling detectors sample the tree.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Which limit the watchdog killed for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KillCause {
    RealTime,
    CpuTime,
    Memory,
    Output,
}

/// Single-assignment cell for the terminal cause: first writer wins, no
/// retraction. Detectors hold a capability to *attempt* the assignment,
/// never the authority to override a prior one.
#[derive(Default)]
pub struct CauseCell {
    cause: Mutex<Option<KillCause>>,
}

impl CauseCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt the assignment. Returns true only for the first writer.
    pub fn try_set(&self, cause: KillCause) -> bool {
        let mut slot = self.cause.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(cause);
            true
        } else {
            false
        }
    }

    pub fn get(&self) -> Option<KillCause> {
        *self.cause.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A watchdog armed over one launched tree.
pub struct Watchdog {
    handle: JoinHandle<ResourceUsage>,
    stop_tx: Sender<()>,
    cause: Arc<CauseCell>,
}

impl Watchdog {
    /// Arm the detectors over the process group `pgid`. Runs until
    /// [`Watchdog::disarm`]; the caller blocks in `wait4` meanwhile.
    pub fn arm(
        req: &ExecutionRequest,
        pgid: i32,
        cgroup: Option<Arc<CgroupScope>>,
    ) -> crate::types::Result<Watchdog> {
        let cause = Arc::new(CauseCell::new());
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let cell = Arc::clone(&cause);
        let stdout = req.stdout.clone();
        let stderr = req.stderr.clone();
        let real_limit = Duration::from_millis(req.max_real_time);
        let cpu_limit_ms = req.max_cpu_time.saturating_mul(1000);
        let mem_limit = req.max_memory;
        let output_limit = req.max_output_size;

        let handle = thread::Builder::new()
            .name(format!("watchdog-{}", pgid))
            .spawn(move || {
                let monitor = TreeMonitor::new(pgid);
                let deadline = after(real_limit);
                let ticker = tick(POLL_INTERVAL);
                let mut peak = ResourceUsage::default();

                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(deadline) -> _ => {
                            fire(&cell, KillCause::RealTime, pgid);
                            // Keep sampling until disarm so the peaks stay
                            // current while the kill lands.
                        }
                        recv(ticker) -> _ => {
                            let usage = monitor.observe(cgroup.as_deref(), &stdout, &stderr);
                            peak.merge_max(&usage);

                            if peak.cpu_time_ms >= cpu_limit_ms {
                                fire(&cell, KillCause::CpuTime, pgid);
                            }
                            if peak.peak_memory_bytes >= mem_limit
                                || cgroup.as_deref().map(|cg| cg.oom_killed()).unwrap_or(false)
                            {
                                fire(&cell, KillCause::Memory, pgid);
                            }
                            if peak.output_bytes >= output_limit {
                                fire(&cell, KillCause::Output, pgid);
                            }
                        }
                    }
                }

                peak
            })?;

        Ok(Watchdog {
            handle,
            stop_tx,
            cause,
        })
    }

    /// Stop the detectors and collect the peak usage they observed.
    /// Called after the direct child has been reaped.
    pub fn disarm(self) -> (ResourceUsage, Option<KillCause>) {
        let _ = self.stop_tx.send(());
        let usage = self.handle.join().unwrap_or_default();
        let cause = self.cause.get();
        (usage, cause)
    }
}

/// First-writer-wins: only the detector that actually won the cell delivers
/// the kill, so the group sees exactly one termination authority.
fn fire(cell: &CauseCell, cause: KillCause, pgid: i32) {
    if cell.try_set(cause) {
        log::info!("watchdog kill: pgid={} cause={:?}", pgid, cause);
        kill_group(pgid);
    }
}

/// Signal the entire process group. Targeting the group rather than any
/// single pid is what an actively forking tree cannot outrun.
pub fn kill_group(pgid: i32) {
    let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
}

/// Block until every member of the group is gone, re-killing as needed.
/// An adversarial tree may keep forking between the signal and the scan;
/// repeated group-wide SIGKILL converges because the process-count backstop
/// bounds how many members can ever exist at once.
pub fn reap_group(
    pgid: i32,
    monitor: &TreeMonitor,
    cgroup: Option<&CgroupScope>,
) -> crate::types::Result<()> {
    const ATTEMPTS: u32 = 200;

    if let Some(cg) = cgroup {
        cg.kill_remaining(ATTEMPTS)?;
    }

    for _ in 0..ATTEMPTS {
        if !monitor.group_alive() {
            return Ok(());
        }
        kill_group(pgid);
        thread::sleep(Duration::from_millis(10));
    }

    Err(crate::types::SandboxError::Reap {
        pgid,
        details: "process group still has live members after repeated SIGKILL".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_writer_wins() {
        let cell = CauseCell::new();
        assert!(cell.try_set(KillCause::RealTime));
        assert!(!cell.try_set(KillCause::CpuTime));
        assert!(!cell.try_set(KillCause::RealTime));
        assert_eq!(cell.get(), Some(KillCause::RealTime));
    }

    #[test]
    fn empty_cell_reads_none() {
        let cell = CauseCell::new();
        assert_eq!(cell.get(), None);
    }

    #[test]
    fn concurrent_writers_assign_exactly_once() {
        let cell = Arc::new(CauseCell::new());
        let mut handles = Vec::new();
        for cause in [
            KillCause::RealTime,
            KillCause::CpuTime,
            KillCause::Memory,
            KillCause::Output,
        ] {
            let cell = Arc::clone(&cell);
            handles.push(thread::spawn(move || cell.try_set(cause)));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
        assert!(cell.get().is_some());
    }

    #[test]
    fn reaping_an_empty_group_succeeds() {
        // A group id nothing belongs to: reap must see it as already drained.
        let unlikely = 0x3FFF_FF00;
        let monitor = TreeMonitor::new(unlikely);
        assert!(reap_group(unlikely, &monitor, None).is_ok());
    }
}
