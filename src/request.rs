/// Wire-format parsing and request validation
use crate::types::{ExecutionRequest, Result, SandboxError};

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// One execution request as it arrives on the wire: one JSON object per line.
///
/// `uid`/`gid` are nullable; everything else is required. Unknown fields are
/// ignored so callers can carry their own bookkeeping keys.
#[derive(Debug, Deserialize)]
pub struct RawRequest {
    pub bin: PathBuf,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub stdin: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub max_real_time: u64,
    pub max_cpu_time: u64,
    pub max_memory: u64,
    pub max_output_size: u64,
}

/// Parse one request line. A malformed line is a contained per-request
/// failure, never a service crash.
pub fn parse_line(line: &str) -> Result<RawRequest> {
    serde_json::from_str(line).map_err(|e| SandboxError::Validation(format!("bad request: {}", e)))
}

/// Validate a raw request into an [`ExecutionRequest`].
///
/// Checks: the target exists and is executable, every numeric limit is
/// strictly positive, the stdin source is readable and the stdout/stderr
/// targets are creatable. No side effects beyond the checks; the launcher
/// opens the redirect files itself.
pub fn validate(raw: RawRequest) -> Result<ExecutionRequest> {
    check_executable(&raw.bin)?;

    check_positive("max_real_time", raw.max_real_time)?;
    check_positive("max_cpu_time", raw.max_cpu_time)?;
    check_positive("max_memory", raw.max_memory)?;
    check_positive("max_output_size", raw.max_output_size)?;

    if raw.uid == Some(0) || raw.gid == Some(0) {
        return Err(SandboxError::Validation(
            "refusing to run the target as uid/gid 0".to_string(),
        ));
    }

    check_readable(&raw.stdin)?;
    check_creatable(&raw.stdout)?;
    check_creatable(&raw.stderr)?;

    Ok(ExecutionRequest {
        bin: raw.bin,
        uid: raw.uid,
        gid: raw.gid,
        stdin: raw.stdin,
        stdout: raw.stdout,
        stderr: raw.stderr,
        max_real_time: raw.max_real_time,
        max_cpu_time: raw.max_cpu_time,
        max_memory: raw.max_memory,
        max_output_size: raw.max_output_size,
    })
}

fn check_positive(name: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(SandboxError::Validation(format!(
            "{} must be positive",
            name
        )));
    }
    Ok(())
}

fn check_executable(bin: &Path) -> Result<()> {
    let meta = std::fs::metadata(bin).map_err(|e| {
        SandboxError::Validation(format!("executable {}: {}", bin.display(), e))
    })?;
    if !meta.is_file() {
        return Err(SandboxError::Validation(format!(
            "executable {} is not a regular file",
            bin.display()
        )));
    }
    // At least one execute bit; the kernel does the authoritative check at
    // exec time under the target credentials.
    if meta.permissions().mode() & 0o111 == 0 {
        return Err(SandboxError::Validation(format!(
            "{} is not executable",
            bin.display()
        )));
    }
    Ok(())
}

fn check_readable(path: &Path) -> Result<()> {
    std::fs::File::open(path)
        .map(drop)
        .map_err(|e| SandboxError::Validation(format!("stdin {}: {}", path.display(), e)))
}

fn check_creatable(path: &Path) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let meta = std::fs::metadata(dir).map_err(|e| {
        SandboxError::Validation(format!("output directory {}: {}", dir.display(), e))
    })?;
    if !meta.is_dir() {
        return Err(SandboxError::Validation(format!(
            "output directory {} is not a directory",
            dir.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_request(bin: &str, dir: &Path) -> RawRequest {
        RawRequest {
            bin: PathBuf::from(bin),
            uid: None,
            gid: None,
            stdin: PathBuf::from("/dev/null"),
            stdout: dir.join("out"),
            stderr: dir.join("err"),
            max_real_time: 1000,
            max_cpu_time: 1,
            max_memory: 256 * 1024 * 1024,
            max_output_size: 32 * 1024 * 1024,
        }
    }

    #[test]
    fn parses_wire_request() {
        let line = r#"{"bin":"/bin/true","uid":null,"gid":null,
            "stdin":"/dev/null","stdout":"/tmp/o","stderr":"/tmp/e",
            "max_real_time":1000,"max_cpu_time":1,
            "max_memory":1048576,"max_output_size":1024}"#;
        let raw = parse_line(line).unwrap();
        assert_eq!(raw.bin, PathBuf::from("/bin/true"));
        assert_eq!(raw.uid, None);
        assert_eq!(raw.max_real_time, 1000);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(parse_line("not json").is_err());
        assert!(parse_line("{\"bin\":").is_err());
    }

    #[test]
    fn rejects_missing_required_field() {
        let line = r#"{"bin":"/bin/true"}"#;
        assert!(parse_line(line).is_err());
    }

    #[test]
    fn rejects_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let raw = base_request("/no/such/binary", dir.path());
        assert!(validate(raw).is_err());
    }

    #[test]
    fn rejects_non_executable_file() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("data.txt");
        std::fs::File::create(&plain)
            .unwrap()
            .write_all(b"x")
            .unwrap();
        let raw = base_request(plain.to_str().unwrap(), dir.path());
        assert!(validate(raw).is_err());
    }

    #[test]
    fn rejects_zero_limits() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = base_request("/bin/true", dir.path());
        raw.max_cpu_time = 0;
        assert!(validate(raw).is_err());

        let mut raw = base_request("/bin/true", dir.path());
        raw.max_memory = 0;
        assert!(validate(raw).is_err());
    }

    #[test]
    fn rejects_root_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = base_request("/bin/true", dir.path());
        raw.uid = Some(0);
        assert!(validate(raw).is_err());
    }

    #[test]
    fn accepts_well_formed_request() {
        let dir = tempfile::tempdir().unwrap();
        let raw = base_request("/bin/true", dir.path());
        let req = validate(raw).unwrap();
        assert_eq!(req.bin, PathBuf::from("/bin/true"));
        assert_eq!(req.max_cpu_time, 1);
    }
}
