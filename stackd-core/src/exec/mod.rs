//! Process execution bridge.
//!
//! Spawns external commands and pumps their standard streams concurrently:
//! one task feeds stdin while two more drain stdout and stderr. OS pipes
//! have bounded buffers, so every stream direction must make progress
//! independently or a child blocked on a full pipe deadlocks the bridge.
//!
//! Output is delivered incrementally through an [`OutputSink`] so callers
//! streaming to an HTTP response observe live progress. Chunks preserve
//! each stream's own emission order; stdout/stderr interleaving relative
//! to each other is unspecified.

use crate::error::{Result, StackdError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Read buffer size for stream pumping.
const CHUNK_SIZE: usize = 8192;

/// Streaming consumer for child process output.
pub type OutputSink = mpsc::Sender<Bytes>;

/// One command invocation: argument vector, input bytes, environment
/// overlay, and the success policy applied to the exit status.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Argument vector; the first element is the program.
    pub command: Vec<String>,
    /// Bytes fed to the child's stdin; stdin is closed at end-of-input.
    pub stdin: Option<Vec<u8>>,
    /// Environment overlay merged over the parent environment (the overlay
    /// wins on key conflicts). May carry secret values; never logged.
    pub env: HashMap<String, String>,
    /// With this set, a non-zero exit only counts as failure if stderr
    /// produced at least one byte.
    pub stderr_is_failure: bool,
    /// Fail with `CommandFailure` instead of returning a non-zero code.
    pub check: bool,
    /// Whether stderr chunks are forwarded to the sink alongside stdout.
    /// Stderr is always captured for the failure policy either way.
    pub stderr_to_sink: bool,
}

impl Default for Invocation {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            stdin: None,
            env: HashMap::new(),
            stderr_is_failure: false,
            check: false,
            stderr_to_sink: true,
        }
    }
}

impl Invocation {
    /// Create an invocation from an argument vector.
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { command: command.into_iter().map(Into::into).collect(), ..Self::default() }
    }

    /// Feed the given bytes to the child's stdin.
    pub fn with_stdin(mut self, stdin: Vec<u8>) -> Self {
        self.stdin = Some(stdin);
        self
    }

    /// Merge the given environment overlay over the parent environment.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Fail with `CommandFailure` on a failed exit.
    pub fn checked(mut self) -> Self {
        self.check = true;
        self
    }

    /// `checked`, and additionally require stderr output before treating a
    /// non-zero exit as failure.
    pub fn strict(mut self) -> Self {
        self.stderr_is_failure = true;
        self.check = true;
        self
    }

    /// Deliver only stdout to the sink. Stderr is still drained and
    /// captured for the failure policy, just not forwarded.
    pub fn stdout_only(mut self) -> Self {
        self.stderr_to_sink = false;
        self
    }
}

/// Seam for running external commands, so orchestration logic can be
/// exercised against a scripted implementation in tests.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run a command, streaming output chunks into `sink` as they arrive.
    /// Returns the child's exit code (unless `check` turns a failure into
    /// a `CommandFailure` error).
    async fn run(
        &self,
        invocation: Invocation,
        sink: OutputSink,
        cancel: CancellationToken,
    ) -> Result<i32>;

    /// Run a command and collect its streamed stdout as UTF-8 text.
    /// Stderr never reaches the returned text; callers parse this output,
    /// so runtime warnings must not masquerade as result lines.
    async fn capture(&self, invocation: Invocation) -> Result<String> {
        let (tx, mut rx) = mpsc::channel::<Bytes>(64);
        let collect = async {
            let mut buf = Vec::new();
            while let Some(chunk) = rx.recv().await {
                buf.extend_from_slice(&chunk);
            }
            buf
        };
        let (code, buf) =
            tokio::join!(self.run(invocation.stdout_only(), tx, CancellationToken::new()), collect);
        code?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Runner backed by real OS processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

#[async_trait]
impl Runner for ProcessRunner {
    async fn run(
        &self,
        invocation: Invocation,
        sink: OutputSink,
        cancel: CancellationToken,
    ) -> Result<i32> {
        let program = invocation
            .command
            .first()
            .cloned()
            .ok_or_else(|| StackdError::Internal("Empty command".to_string()))?;

        debug!(command = ?invocation.command, "Spawning child process");

        let mut cmd = Command::new(&program);
        cmd.args(&invocation.command[1..])
            .envs(&invocation.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| StackdError::SpawnFailed { command: program.clone(), source: e })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Stdin feeder. Runs in its own task so a child that stops reading
        // input to write output cannot stall the bridge. Dropping the handle
        // closes the pipe and signals end-of-input.
        let input = invocation.stdin;
        let stdin_task = tokio::spawn(async move {
            if let (Some(mut stdin), Some(bytes)) = (stdin, input) {
                if let Err(e) = stdin.write_all(&bytes).await {
                    debug!(error = %e, "Child closed stdin before end-of-input");
                }
            }
        });

        // Stdout drain.
        let stdout_sink = sink.clone();
        let stdout_task = tokio::spawn(async move {
            if let Some(mut stdout) = stdout {
                pump(&mut stdout, &stdout_sink).await;
            }
        });

        // Stderr drain. Also accumulates the captured text needed for the
        // failure policy and `CommandFailure`.
        let forward_stderr = invocation.stderr_to_sink;
        let stderr_task = tokio::spawn(async move {
            let mut captured = Vec::new();
            if let Some(mut stderr) = stderr {
                let mut buf = [0u8; CHUNK_SIZE];
                loop {
                    match stderr.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            captured.extend_from_slice(&buf[..n]);
                            // A dropped receiver is not fatal; keep reading so
                            // the child never blocks on a full pipe.
                            if forward_stderr {
                                let _ = sink.send(Bytes::copy_from_slice(&buf[..n])).await;
                            }
                        }
                    }
                }
            }
            captured
        });

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| {
                StackdError::Internal(format!("Failed to wait for {}: {}", program, e))
            })?,
            _ = cancel.cancelled() => {
                warn!(command = %program, "Cancelled, killing child process");
                let _ = child.kill().await;
                stdin_task.abort();
                stdout_task.abort();
                stderr_task.abort();
                return Err(StackdError::Cancelled);
            }
        };

        // Let the pumps drain whatever is left in the pipes.
        let _ = stdin_task.await;
        let _ = stdout_task.await;
        let stderr_bytes = stderr_task.await.unwrap_or_default();

        let exit_code = status.code().unwrap_or(-1);
        let failed =
            exit_code != 0 && (!invocation.stderr_is_failure || !stderr_bytes.is_empty());

        if invocation.check && failed {
            return Err(StackdError::CommandFailure {
                exit_code,
                stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
            });
        }

        Ok(exit_code)
    }
}

/// Read a stream to EOF, forwarding each chunk to the sink.
async fn pump(stream: &mut (impl AsyncRead + Unpin), sink: &OutputSink) {
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                // A dropped receiver is not an error: keep draining so the
                // child can finish writing.
                let _ = sink.send(Bytes::copy_from_slice(&buf[..n])).await;
            }
        }
    }
}
