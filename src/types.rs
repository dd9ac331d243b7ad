/// Core types for the runbox sandbox service
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// A fully validated execution request. Immutable, one per call.
///
/// Produced by [`crate::request::validate`]; nothing in the launcher or
/// watchdog ever mutates it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Path to the target executable
    pub bin: PathBuf,
    /// User ID to run as; `None` means the service's own identity
    pub uid: Option<u32>,
    /// Group ID to run as
    pub gid: Option<u32>,
    /// File opened read-only as the target's stdin
    pub stdin: PathBuf,
    /// File created/truncated as the target's stdout
    pub stdout: PathBuf,
    /// File created/truncated as the target's stderr
    pub stderr: PathBuf,
    /// Wall-clock ceiling in milliseconds, measured from group start
    pub max_real_time: u64,
    /// Cumulative CPU-time ceiling in seconds, summed over the whole tree
    pub max_cpu_time: u64,
    /// Peak resident memory ceiling in bytes, summed over the whole tree
    pub max_memory: u64,
    /// Ceiling on combined bytes written to the stdout+stderr targets
    pub max_output_size: u64,
}

/// Resource usage observed for one request's process tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub cpu_time_ms: u64,
    pub real_time_ms: u64,
    pub peak_memory_bytes: u64,
    pub output_bytes: u64,
}

impl ResourceUsage {
    /// Fold another observation in, keeping the larger figure per axis.
    /// Usage numbers are monotone; sources (cgroup, /proc scan, rusage)
    /// each under-report in different situations.
    pub fn merge_max(&mut self, other: &ResourceUsage) {
        self.cpu_time_ms = self.cpu_time_ms.max(other.cpu_time_ms);
        self.real_time_ms = self.real_time_ms.max(other.real_time_ms);
        self.peak_memory_bytes = self.peak_memory_bytes.max(other.peak_memory_bytes);
        self.output_bytes = self.output_bytes.max(other.output_bytes);
    }
}

/// Why a sandboxed execution ended. Exactly one per request.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    /// Exited zero within every limit
    Success,
    /// Ran, but exited nonzero or died to an unrelated signal
    RuntimeError,
    CpuTimeLimitExceeded,
    RealTimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    /// Validation or launch failed before a sandboxed process meaningfully ran
    SystemError,
}

/// Structured result reported back to the caller.
///
/// Field names are the wire format: serialized as-is, one JSON object per
/// response line.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Exit code; absent if the process was killed by a signal
    pub exit_code: Option<i32>,
    /// Terminating signal; absent on normal exit
    pub signal: Option<i32>,
    pub cpu_time_used_ms: u64,
    pub real_time_used_ms: u64,
    pub peak_memory_bytes: u64,
    pub output_bytes_written: u64,
    pub outcome: Outcome,
}

impl ExecutionResult {
    /// Result for a request that never produced a running sandbox.
    pub fn system_error() -> Self {
        Self {
            exit_code: None,
            signal: None,
            cpu_time_used_ms: 0,
            real_time_used_ms: 0,
            peak_memory_bytes: 0,
            output_bytes_written: 0,
            outcome: Outcome::SystemError,
        }
    }
}

/// Error taxonomy for runbox.
///
/// Everything except `Reap` is contained within one request and degrades to
/// a classified response; `Reap` means the kill-and-reap contract itself is
/// broken and must surface as a service-level fault.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("launch failed: {0}")]
    Launch(String),

    #[error("privilege drop failed: {0}")]
    Privilege(String),

    #[error("cgroup error: {0}")]
    Cgroup(String),

    #[error("monitor error: {0}")]
    Monitor(String),

    #[error("failed to reap process group {pgid}: {details}")]
    Reap { pgid: i32, details: String },
}

impl SandboxError {
    /// True for the one error class that must abort the service loop
    /// instead of degrading to a SYSTEM_ERROR response.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SandboxError::Reap { .. })
    }
}

impl From<nix::errno::Errno> for SandboxError {
    fn from(err: nix::errno::Errno) -> Self {
        SandboxError::Io(std::io::Error::from_raw_os_error(err as i32))
    }
}

/// Result type alias for runbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;
