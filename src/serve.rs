/// Line-oriented request/response transport
///
/// One JSON request per input line; per request, exactly two output lines:
/// a numeric status line, then the JSON result. The pair is formatted into a
/// single buffer and written with one call, so responses from consecutive
/// requests can never interleave. Requests are strictly serialized: a
/// response is fully emitted before the next line is read.
///
/// The status line is a transport-level acknowledgement only: 0 when the
/// request line was parseable, 1 when it was malformed. It is distinct
/// from the `outcome` field in the JSON body, which carries the actual
/// classification (including SYSTEM_ERROR for requests that failed
/// validation or launch).
use crate::executor::SandboxExecutor;
use crate::request;
use crate::types::{ExecutionResult, Result};

use std::io::{BufRead, Write};

const STATUS_OK: i32 = 0;
const STATUS_BAD_REQUEST: i32 = 1;

/// Serve requests from `input` until EOF.
///
/// Per-request failures of every kind degrade to a SYSTEM_ERROR response and
/// the loop continues; only a broken kill-and-reap contract (or a dead
/// output stream) aborts the service.
pub fn serve(
    executor: &SandboxExecutor,
    mut input: impl BufRead,
    mut output: impl Write,
) -> Result<()> {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if input.read_until(b'\n', &mut buf)? == 0 {
            return Ok(());
        }

        // A line the reader cannot even decode is malformed input, not a
        // service fault; answer it and keep reading.
        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line,
            Err(e) => {
                log::warn!("request line is not valid UTF-8: {}", e);
                let result = ExecutionResult::system_error();
                write_response(&mut output, STATUS_BAD_REQUEST, &result)?;
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let (status, result) = handle_line(executor, line)?;
        write_response(&mut output, status, &result)?;
    }
}

/// Resolve one request line to a (status, result) pair. Errors returned here
/// are service-fatal; everything contained is already folded into the pair.
fn handle_line(executor: &SandboxExecutor, line: &str) -> Result<(i32, ExecutionResult)> {
    let raw = match request::parse_line(line) {
        Ok(raw) => raw,
        Err(e) => {
            log::warn!("malformed request: {}", e);
            return Ok((STATUS_BAD_REQUEST, ExecutionResult::system_error()));
        }
    };

    match executor.execute_raw(raw) {
        Ok(result) => Ok((STATUS_OK, result)),
        Err(e) if e.is_fatal() => {
            log::error!("service fault: {}", e);
            Err(e)
        }
        Err(e) => {
            log::warn!("request failed before sandboxed execution: {}", e);
            Ok((STATUS_OK, ExecutionResult::system_error()))
        }
    }
}

fn write_response(output: &mut impl Write, status: i32, result: &ExecutionResult) -> Result<()> {
    let body = serde_json::to_string(result)
        .map_err(|e| crate::types::SandboxError::Monitor(format!("serialize result: {}", e)))?;
    let pair = format!("{}\n{}\n", status, body);
    output.write_all(pair.as_bytes())?;
    output.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Outcome;
    use std::io::Cursor;

    fn run_lines(input: &str) -> Vec<String> {
        let executor = SandboxExecutor::new(false);
        let mut out = Vec::new();
        serve(&executor, Cursor::new(input.to_string()), &mut out).unwrap();
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn malformed_line_yields_one_system_error_and_loop_continues() {
        let dir = tempfile::tempdir().unwrap();
        let good = serde_json::json!({
            "bin": "/bin/true",
            "uid": null, "gid": null,
            "stdin": "/dev/null",
            "stdout": dir.path().join("out"),
            "stderr": dir.path().join("err"),
            "max_real_time": 5000,
            "max_cpu_time": 5,
            "max_memory": 256u64 * 1024 * 1024,
            "max_output_size": 1024 * 1024,
        });
        let input = format!("this is not json\n{}\n", good);
        let lines = run_lines(&input);

        // Two requests, two (status, body) pairs.
        assert_eq!(lines.len(), 4);

        assert_eq!(lines[0].parse::<i32>().unwrap(), STATUS_BAD_REQUEST);
        let first: ExecutionResult = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(first.outcome, Outcome::SystemError);

        assert_eq!(lines[2].parse::<i32>().unwrap(), STATUS_OK);
        let second: ExecutionResult = serde_json::from_str(&lines[3]).unwrap();
        assert_eq!(second.outcome, Outcome::Success);
    }

    #[test]
    fn unresolvable_binary_degrades_to_system_error() {
        let dir = tempfile::tempdir().unwrap();
        let req = serde_json::json!({
            "bin": "/no/such/binary",
            "uid": null, "gid": null,
            "stdin": "/dev/null",
            "stdout": dir.path().join("out"),
            "stderr": dir.path().join("err"),
            "max_real_time": 1000,
            "max_cpu_time": 1,
            "max_memory": 1024 * 1024,
            "max_output_size": 1024,
        });
        let lines = run_lines(&format!("{}\n", req));
        assert_eq!(lines.len(), 2);
        // The request parsed, so transport-level it is acknowledged.
        assert_eq!(lines[0].parse::<i32>().unwrap(), STATUS_OK);
        let result: ExecutionResult = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(result.outcome, Outcome::SystemError);
    }

    #[test]
    fn non_utf8_line_yields_one_system_error_and_loop_continues() {
        let executor = SandboxExecutor::new(false);
        let mut out = Vec::new();
        let input: Vec<u8> = vec![0xff, 0xfe, b'{', b'\n'];
        serve(&executor, Cursor::new(input), &mut out).unwrap();

        let lines: Vec<String> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(String::from)
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].parse::<i32>().unwrap(), STATUS_BAD_REQUEST);
        let result: ExecutionResult = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(result.outcome, Outcome::SystemError);
    }

    #[test]
    fn empty_lines_are_skipped() {
        let lines = run_lines("\n   \n");
        assert!(lines.is_empty());
    }

    #[test]
    fn status_line_is_always_an_integer() {
        let lines = run_lines("{}\n");
        assert_eq!(lines.len(), 2);
        assert!(lines[0].parse::<i32>().is_ok());
    }
}
