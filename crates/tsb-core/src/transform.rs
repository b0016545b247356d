//! Runs the external transformation program over an extracted template.
//!
//! Invocation: `<program> [args...] --path=<extracted-dir>`. The program writes
//! its output as sibling directories inside the staging area and exits 0 on
//! success. Its stdout/stderr are forwarded to the log line by line.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use crate::{errors::Error, Result};

const STDERR_TAIL_MAX_BYTES: usize = 16 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 200;
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct TransformConfig {
    pub program: PathBuf,
    /// Extra arguments placed before `--path=`.
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// `None` waits forever.
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct TransformReport {
    pub code: i32,
    pub elapsed: Duration,
}

/// Seam between the pipeline and the transformation backend.
#[async_trait]
pub trait TransformRunner: Send + Sync {
    async fn run(&self, extracted: &Path, cancel: &CancellationToken) -> Result<TransformReport>;
}

#[derive(Clone, Debug)]
pub struct CommandTransformer {
    cfg: TransformConfig,
}

#[derive(Clone, Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        // +1 for the '\n' we join with later.
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > STDERR_TAIL_MAX_LINES || self.bytes > STDERR_TAIL_MAX_BYTES {
            let Some(front) = self.lines.pop_front() else {
                break;
            };
            self.bytes = self.bytes.saturating_sub(front.len() + 1);
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut(Duration),
}

impl CommandTransformer {
    pub fn new(cfg: TransformConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &TransformConfig {
        &self.cfg
    }

    /// Arguments passed to the program for `extracted`.
    pub fn build_args(&self, extracted: &Path) -> Vec<String> {
        let mut args = self.cfg.args.clone();
        args.push(format!("--path={}", extracted.display()));
        args
    }

    fn command(&self, extracted: &Path) -> Command {
        let mut cmd = Command::new(&self.cfg.program);
        cmd.args(self.build_args(extracted))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cfg.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl TransformRunner for CommandTransformer {
    async fn run(&self, extracted: &Path, cancel: &CancellationToken) -> Result<TransformReport> {
        let started = Instant::now();
        let mut child = self.command(extracted).spawn().map_err(|e| {
            Error::External(format!(
                "failed to start {}: {e}",
                self.cfg.program.display()
            ))
        })?;
        tracing::info!(
            program = %self.cfg.program.display(),
            path = %extracted.display(),
            pid = ?child.id(),
            "transform started"
        );

        let tail: Arc<Mutex<StderrTail>> = Arc::new(Mutex::new(StderrTail::default()));

        // Drain both pipes in the background so the child never blocks on a full pipe.
        let stdout_task = child.stdout.take().map(|stdout| {
            tokio::spawn(async move {
                let mut r = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    tracing::info!(stream = "stdout", "{line}");
                }
            })
        });
        let stderr_task = child.stderr.take().map(|stderr| {
            let tail = tail.clone();
            tokio::spawn(async move {
                let mut r = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    tracing::warn!(stream = "stderr", "{line}");
                    tail.lock().await.push_line(line);
                }
            })
        });

        let timeout = self.cfg.timeout;
        let deadline = async move {
            match timeout {
                Some(d) => {
                    tokio::time::sleep(d).await;
                    d
                }
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = cancel.cancelled() => Outcome::Cancelled,
            d = deadline => Outcome::TimedOut(d),
        };

        let status = match outcome {
            Outcome::Exited(status) => status?,
            Outcome::Cancelled => {
                kill_child(&mut child).await?;
                tracing::warn!(path = %extracted.display(), "transform cancelled");
                return Err(Error::Cancelled);
            }
            Outcome::TimedOut(d) => {
                kill_child(&mut child).await?;
                tracing::warn!(path = %extracted.display(), timeout = ?d, "transform timed out");
                return Err(Error::TransformTimeout(d));
            }
        };

        // Grandchildren may hold the pipes open, so the wait for the last lines is bounded.
        for task in [stdout_task, stderr_task].into_iter().flatten() {
            let _ = tokio::time::timeout(PIPE_DRAIN_GRACE, task).await;
        }

        let elapsed = started.elapsed();
        if !status.success() {
            return Err(Error::TransformExit {
                code: status.code(),
                stderr: tail.lock().await.snapshot(),
            });
        }

        tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "transform finished");
        Ok(TransformReport {
            code: status.code().unwrap_or(0),
            elapsed,
        })
    }
}

async fn kill_child(child: &mut Child) -> Result<()> {
    // `try_wait` reaps a child that already exited.
    if child.try_wait()?.is_some() {
        return Ok(());
    }
    child.kill().await?;
    Ok(())
}
