//! runbox: a sandboxed execution service
//!
//! Given a path to an untrusted executable and a set of resource ceilings,
//! runbox runs it to completion or forcible termination and reports a
//! structured, deterministic outcome. Targets may fork, exec, spin-loop,
//! allocate unboundedly or fork-bomb; limits hold across the entire
//! descendant tree, not just the first child.
//!
//! # Architecture
//!
//! Per-request pipeline, leaves first:
//!
//! - [`request`]: wire parsing and validation into an [`types::ExecutionRequest`]
//! - [`cgroup`]: per-request cgroup v1 scope for tree-wide accounting
//! - [`launcher`]: process-group creation, rlimits, stdio redirection,
//!   privilege drop, exec
//! - [`monitor`]: tree-wide usage sampling (cgroup readback + /proc scan)
//! - [`watchdog`]: four detectors racing the running tree; first-writer-wins
//!   cause cell; group-wide kill and reap
//! - [`classifier`]: pure mapping from termination facts to one
//!   [`types::Outcome`]
//! - [`executor`]: orchestration of one request, start to finalized result
//! - [`serve`]: the line-oriented JSON transport
//!
//! # Design rules
//!
//! 1. Limits are request-scoped objects applied at launch, never ambient
//!    process-wide state; nothing leaks between requests.
//! 2. The terminal cause is assigned exactly once, first writer wins.
//! 3. Kills target the process group, never individual descendant pids.
//! 4. The group is fully reaped before any result is finalized; a reap
//!    failure is the only service-fatal error.

pub mod cgroup;
pub mod classifier;
pub mod cli;
pub mod executor;
pub mod launcher;
pub mod monitor;
pub mod request;
pub mod serve;
pub mod types;
pub mod watchdog;

pub use executor::SandboxExecutor;
pub use types::{ExecutionRequest, ExecutionResult, Outcome, Result, SandboxError};
