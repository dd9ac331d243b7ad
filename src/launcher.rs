/// Sandbox launcher: spawn the target as an isolated, accountable process tree
///
/// Ordering inside the child, between `fork` and `exec`, is the whole game:
///
/// 1. stdio redirection (done by `Command` from files opened in the parent)
/// 2. new process group / new session
/// 3. cgroup attachment, so accounting binds before the first instruction
/// 4. rlimit registration, while still privileged
/// 5. privilege drop, GID strictly before UID
/// 6. exec
///
/// Everything registered in 2-5 persists across the exec and across any
/// further fork/exec chain the target performs.
use crate::cgroup::CgroupScope;
use crate::types::{ExecutionRequest, Result, SandboxError};

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::time::Instant;

use nix::sys::resource::{setrlimit, Resource};

/// Hard ceiling on concurrently live processes in one tree, independent of
/// any caller-specified limit. Containment, not a detector: at the ceiling
/// further forks fail and the tree keeps running until a real detector fires.
pub const PROCESS_BACKSTOP: u32 = 64;

/// RLIMIT_AS floor. The caller's memory ceiling is enforced exactly by the
/// watchdog; the address-space rlimit is only a kernel backstop and must not
/// be set so low that `execve` itself cannot map the target image.
const MEMORY_RLIMIT_FLOOR: u64 = 16 * 1024 * 1024;

/// A running, isolated process tree.
#[derive(Debug)]
pub struct LaunchedTree {
    /// Direct child pid; also the process-group id (the child is the leader).
    pub pid: u32,
    pub started: Instant,
    // Held so the handle outlives the request; reaping goes through wait4 on
    // the pid, never through Child::wait.
    _child: Child,
}

impl LaunchedTree {
    pub fn pgid(&self) -> i32 {
        self.pid as i32
    }
}

/// Spawn the target executable under the request's limits.
///
/// Any failure in here (unresolvable path, unopenable redirect target,
/// rlimit registration, privilege drop, exec) surfaces as a launch error
/// and never hands control to unsandboxed code.
pub fn spawn(req: &ExecutionRequest, cgroup: Option<&CgroupScope>) -> Result<LaunchedTree> {
    let stdin = File::open(&req.stdin)
        .map_err(|e| SandboxError::Launch(format!("stdin {}: {}", req.stdin.display(), e)))?;
    let stdout = File::create(&req.stdout)
        .map_err(|e| SandboxError::Launch(format!("stdout {}: {}", req.stdout.display(), e)))?;
    let stderr = File::create(&req.stderr)
        .map_err(|e| SandboxError::Launch(format!("stderr {}: {}", req.stderr.display(), e)))?;

    // Prepared as CStrings up front: the pre_exec closure runs between fork
    // and exec where allocation is off-limits.
    let attach_paths: Vec<CString> = match cgroup {
        Some(cg) => cg
            .procs_paths()
            .into_iter()
            .filter_map(|p| CString::new(p.as_os_str().as_bytes()).ok())
            .collect(),
        None => Vec::new(),
    };

    let uid = req.uid;
    let gid = req.gid;
    let drop_privs = uid.is_some() || gid.is_some();
    let cpu_limit_s = req.max_cpu_time;
    let output_limit = req.max_output_size;
    let as_limit = req.max_memory.max(MEMORY_RLIMIT_FLOOR);

    let mut cmd = Command::new(&req.bin);
    cmd.stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .env_clear()
        .env("PATH", "/usr/local/bin:/usr/bin:/bin");

    // SAFETY: the closure runs in the forked child before exec and only
    // performs async-signal-safe syscalls on pre-built arguments.
    unsafe {
        cmd.pre_exec(move || {
            child_setup(
                drop_privs,
                &attach_paths,
                cpu_limit_s,
                output_limit,
                as_limit,
                uid,
                gid,
            )
        });
    }

    let started = Instant::now();
    let child = cmd
        .spawn()
        .map_err(|e| SandboxError::Launch(format!("{}: {}", req.bin.display(), e)))?;
    let pid = child.id();

    log::debug!("launched {} as pid {} (group leader)", req.bin.display(), pid);

    Ok(LaunchedTree {
        pid,
        started,
        _child: child,
    })
}

/// Runs in the child between fork and exec. Only raw syscalls; any failure
/// aborts the exec and reports back through the spawn error.
fn child_setup(
    drop_privs: bool,
    attach_paths: &[CString],
    cpu_limit_s: u64,
    output_limit: u64,
    as_limit: u64,
    uid: Option<u32>,
    gid: Option<u32>,
) -> io::Result<()> {
    // New group so one killpg reaches the whole tree; a new session on top
    // when the tree runs under a different identity.
    if drop_privs {
        if unsafe { libc::setsid() } < 0 {
            return Err(io::Error::last_os_error());
        }
    } else if unsafe { libc::setpgid(0, 0) } != 0 {
        return Err(io::Error::last_os_error());
    }

    // Join the accounting scope before anything can run or fork.
    for path in attach_paths {
        attach_self(path)?;
    }

    set_rlimit(Resource::RLIMIT_CORE, 0, 0)?;
    // Soft limit delivers SIGXCPU at the ceiling; the hard limit one second
    // later is the kernel's SIGKILL backstop behind the watchdog.
    set_rlimit(Resource::RLIMIT_CPU, cpu_limit_s, cpu_limit_s.saturating_add(1))?;
    set_rlimit(Resource::RLIMIT_FSIZE, output_limit, output_limit)?;
    set_rlimit(Resource::RLIMIT_AS, as_limit, as_limit)?;

    if uid.is_some() {
        // NPROC counts per real uid, so it is only meaningful (and only
        // safe for the service's own identity) under a dedicated sandbox uid.
        let backstop = PROCESS_BACKSTOP as u64;
        set_rlimit(Resource::RLIMIT_NPROC, backstop, backstop)?;
    }

    // GID strictly before UID: after setresuid the process has no authority
    // left to change groups.
    if let Some(gid) = gid {
        if unsafe { libc::setgroups(0, std::ptr::null()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::setresgid(gid, gid, gid) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    if let Some(uid) = uid {
        if unsafe { libc::setresuid(uid, uid, uid) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // A silent pass-through here would run the target privileged.
        if unsafe { libc::geteuid() } != uid {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "uid drop did not take effect",
            ));
        }
    }

    Ok(())
}

fn attach_self(procs_file: &CString) -> io::Result<()> {
    let fd = unsafe { libc::open(procs_file.as_ptr(), libc::O_WRONLY | libc::O_APPEND) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // Writing "0" attaches the calling process.
    let ret = unsafe { libc::write(fd, b"0".as_ptr() as *const libc::c_void, 1) };
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };
    if ret != 1 {
        return Err(err);
    }
    Ok(())
}

fn set_rlimit(resource: Resource, soft: u64, hard: u64) -> io::Result<()> {
    setrlimit(resource, soft, hard).map_err(io::Error::from)
}
