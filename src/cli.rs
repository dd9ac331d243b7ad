/// CLI entrypoint wiring for the runboxd binary
use crate::executor::SandboxExecutor;
use crate::request::RawRequest;
use crate::serve;

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "runboxd", author, version, about = "Sandboxed execution service", long_about = None)]
struct Cli {
    /// Fail hard when cgroup accounting is unavailable instead of degrading
    /// to /proc-based accounting
    #[arg(long, global = true)]
    strict: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve JSON requests from stdin, one per line (default)
    Serve,
    /// Execute a single request from flags and print the result JSON
    Run {
        /// Path to the target executable
        #[arg(long)]
        bin: PathBuf,
        /// User ID to run the target as
        #[arg(long)]
        uid: Option<u32>,
        /// Group ID to run the target as
        #[arg(long)]
        gid: Option<u32>,
        /// File to open as the target's stdin
        #[arg(long, default_value = "/dev/null")]
        stdin: PathBuf,
        /// File to create as the target's stdout
        #[arg(long)]
        stdout: PathBuf,
        /// File to create as the target's stderr
        #[arg(long)]
        stderr: PathBuf,
        /// Wall-clock limit in milliseconds
        #[arg(long, value_name = "ms", default_value_t = 10_000)]
        max_real_time: u64,
        /// CPU-time limit in seconds, cumulative over the tree
        #[arg(long, value_name = "seconds", default_value_t = 10)]
        max_cpu_time: u64,
        /// Peak memory limit in bytes, cumulative over the tree
        #[arg(long, value_name = "bytes", default_value_t = 256 * 1024 * 1024)]
        max_memory: u64,
        /// Limit on combined stdout+stderr bytes
        #[arg(long, value_name = "bytes", default_value_t = 64 * 1024 * 1024)]
        max_output_size: u64,
    },
}

pub fn run() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let executor = SandboxExecutor::new(cli.strict);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let stdin = io::stdin();
            let stdout = io::stdout();
            serve::serve(&executor, stdin.lock(), stdout.lock())
                .context("request loop aborted")?;
        }
        Commands::Run {
            bin,
            uid,
            gid,
            stdin,
            stdout,
            stderr,
            max_real_time,
            max_cpu_time,
            max_memory,
            max_output_size,
        } => {
            let raw = RawRequest {
                bin,
                uid,
                gid,
                stdin,
                stdout,
                stderr,
                max_real_time,
                max_cpu_time,
                max_memory,
                max_output_size,
            };
            let result = executor.execute_raw(raw).context("execution failed")?;
            let out = io::stdout();
            let mut lock = out.lock();
            serde_json::to_writer(&mut lock, &result)?;
            writeln!(lock)?;
        }
    }

    Ok(())
}
