//! Launches the external trainer and supervises it until exit or deadline.
//!
//! Stdout and stderr are read by two forwarding tasks into one channel, so the
//! consumer sees a single interleaved line stream. Lines are pulled one at a
//! time with [`RunningTrainer::next_line`]; [`RunningTrainer::finish`] turns the
//! exit status (or an elapsed deadline) into a [`ProcessOutcome`].
//!
//! The run ends when the trainer process exits, not when its pipes close. The
//! trainer gets its own process group, which is killed once it is done.

use crate::error::{TrainingError, TrainingResult};
use crate::settings::TrainerSettings;
use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Terminal state of a trainer run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Success { tail: Vec<String> },
    Failure { code: i32, tail: Vec<String> },
    TimedOut { after: Duration, tail: Vec<String> },
}

impl ProcessOutcome {
    #[must_use]
    pub fn tail(&self) -> &[String] {
        match self {
            Self::Success { tail } | Self::Failure { tail, .. } | Self::TimedOut { tail, .. } => tail,
        }
    }
}

/// Keeps the last `capacity` lines of output.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { lines: VecDeque::with_capacity(capacity.min(1024)), capacity }
    }

    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    #[must_use]
    pub fn into_lines(self) -> Vec<String> {
        self.lines.into()
    }
}

/// How long output is still collected after the trainer exits. Descendants
/// that inherited its pipes do not hold the job open past this.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct TrainerSupervisor {
    settings: TrainerSettings,
}

impl TrainerSupervisor {
    #[must_use]
    pub fn new(settings: TrainerSettings) -> Self {
        Self { settings }
    }

    fn command(&self, config_path: &Path) -> Command {
        let mut cmd = Command::new(&self.settings.program);
        cmd.args(&self.settings.args);
        cmd.arg(config_path);
        cmd.envs(&self.settings.env);
        cmd.env(&self.settings.module_path_var, &self.settings.module_root);
        if let Some(dir) = &self.settings.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        // Own process group, so the trainer and everything it forks can be
        // signalled together.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// Launch the trainer for `config_path`.
    ///
    /// `timeout` overrides the configured deadline for this run.
    pub fn spawn(&self, config_path: &Path, timeout: Option<Duration>) -> TrainingResult<RunningTrainer> {
        let timeout = timeout.or_else(|| self.settings.timeout());
        let mut child = self.command(config_path).spawn().map_err(|e| {
            TrainingError::Spawn(format!("{} {}: {}", self.settings.program, config_path.display(), e))
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TrainingError::Supervisor("failed to capture trainer stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TrainingError::Supervisor("failed to capture trainer stderr".to_string()))?;
        let readers = vec![forward_lines(stdout, tx.clone()), forward_lines(stderr, tx)];

        let pid = child.id();
        info!(
            pid,
            program = %self.settings.program,
            config = %config_path.display(),
            timeout_secs = timeout.map(|t| t.as_secs()),
            "trainer started"
        );

        Ok(RunningTrainer {
            child,
            pid,
            lines: rx,
            readers,
            tail: OutputTail::new(self.settings.tail_lines),
            deadline: timeout.map(|t| Instant::now() + t),
            timeout,
            exit: None,
            wait_error: None,
            drain_until: None,
            output_closed: false,
            deadline_elapsed: false,
        })
    }

    /// Fire-and-wait: drain all output without per-line handling.
    pub async fn run_to_completion(&self, config_path: &Path, timeout: Option<Duration>) -> TrainingResult<ProcessOutcome> {
        let mut running = self.spawn(config_path, timeout)?;
        while running.next_line().await.is_some() {}
        running.finish().await
    }
}

fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    if tx.send(line.trim_end_matches(['\n', '\r']).to_string()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "trainer output stream closed with error");
                    break;
                }
            }
        }
    })
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// SIGKILL the trainer's process group. Members may already be gone.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pgid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => debug!(pgid, "trainer process group killed"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "failed to kill trainer process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// A live trainer process, exclusively owned by its supervisor loop.
pub struct RunningTrainer {
    child: Child,
    pid: Option<u32>,
    lines: mpsc::UnboundedReceiver<String>,
    readers: Vec<JoinHandle<()>>,
    tail: OutputTail,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    exit: Option<ExitStatus>,
    wait_error: Option<std::io::Error>,
    drain_until: Option<Instant>,
    output_closed: bool,
    deadline_elapsed: bool,
}

impl RunningTrainer {
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Wall-clock deadline of this run, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Next line of combined output.
    ///
    /// Returns `None` once the output is exhausted, the deadline has passed,
    /// or the trainer has exited and the drain grace period is over.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if self.deadline_elapsed || self.output_closed || self.wait_error.is_some() {
                return None;
            }

            if let Some(until) = self.drain_until {
                return match tokio::time::timeout_at(until, self.lines.recv()).await {
                    Ok(Some(line)) => Some(self.record(line)),
                    Ok(None) | Err(_) => {
                        self.output_closed = true;
                        None
                    }
                };
            }

            let deadline = self.deadline;
            tokio::select! {
                line = self.lines.recv() => match line {
                    Some(line) => return Some(self.record(line)),
                    None => {
                        self.output_closed = true;
                        return None;
                    }
                },
                status = self.child.wait() => match status {
                    Ok(status) => {
                        debug!(?status, "trainer exited, draining output");
                        self.exit = Some(status);
                        self.drain_until = Some(Instant::now() + OUTPUT_DRAIN_GRACE);
                    }
                    Err(e) => self.wait_error = Some(e),
                },
                () = sleep_until(deadline) => {
                    self.deadline_elapsed = true;
                    return None;
                }
            }
        }
    }

    fn record(&mut self, line: String) -> String {
        self.tail.push(line.clone());
        line
    }

    /// Wait for the child to exit, killing it if the deadline passes first.
    pub async fn finish(mut self) -> TrainingResult<ProcessOutcome> {
        if let Some(e) = self.wait_error.take() {
            self.release();
            return Err(e.into());
        }
        if self.deadline_elapsed {
            return self.terminate().await;
        }

        let status = match self.exit.take() {
            Some(status) => status,
            None => match self.deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, self.child.wait()).await {
                    Ok(status) => status?,
                    Err(_) => return self.terminate().await,
                },
                None => self.child.wait().await?,
            },
        };

        while let Ok(line) = self.lines.try_recv() {
            self.tail.push(line);
        }
        self.release();

        let tail = std::mem::replace(&mut self.tail, OutputTail::new(0)).into_lines();
        match status.code() {
            Some(0) => {
                info!("trainer exited successfully");
                Ok(ProcessOutcome::Success { tail })
            }
            code => {
                let code = code.unwrap_or(-1);
                warn!(code, "trainer exited with failure");
                Ok(ProcessOutcome::Failure { code, tail })
            }
        }
    }

    async fn terminate(mut self) -> TrainingResult<ProcessOutcome> {
        let after = self.timeout.unwrap_or_default();
        warn!(pid = self.pid, timeout_secs = after.as_secs(), "trainer deadline elapsed, killing");

        kill_process_group(self.pid);
        if let Err(e) = self.child.kill().await {
            // Already exited between the deadline and the kill.
            debug!(error = %e, "kill after deadline failed");
            self.child.wait().await?;
        }
        self.release();

        let tail = std::mem::replace(&mut self.tail, OutputTail::new(0)).into_lines();
        Ok(ProcessOutcome::TimedOut { after, tail })
    }

    /// Kill whatever is left of the trainer's process group and stop reading
    /// its output.
    fn release(&mut self) {
        kill_process_group(self.pid);
        for reader in &self.readers {
            reader.abort();
        }
    }
}
