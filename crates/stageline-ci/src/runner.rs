//! Stage execution.
//!
//! Each command runs through `sh -c` in its own process group so that a
//! timeout or cancellation can take down everything it spawned. Output is
//! streamed line by line at debug level and captured for the stage result.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use stageline_core::{
    CommandRecord, Stage, StageDetail, StageFailure, StageKind, StageOutcome, StageResult,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::report::{parse_format_report, parse_test_report};

/// Time between SIGTERM and SIGKILL when tearing down a process group.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Longer lines are truncated in the captured output.
const MAX_LINE_LENGTH: usize = 16 * 1024;

/// How a command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    /// Killed by a signal not sent by us.
    Signalled,
    TimedOut,
    Cancelled,
    SpawnFailed(String),
}

impl Termination {
    pub fn success(&self) -> bool {
        matches!(self, Termination::Exited(0))
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Termination::Exited(code) => Some(*code),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Termination::Exited(code) => format!("exit code {code}"),
            Termination::Signalled => "terminated by signal".to_string(),
            Termination::TimedOut => "timed out".to_string(),
            Termination::Cancelled => "cancelled".to_string(),
            Termination::SpawnFailed(e) => format!("failed to spawn: {e}"),
        }
    }
}

/// Result of one command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub command: String,
    pub termination: Termination,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.termination.success()
    }

    pub fn record(&self) -> CommandRecord {
        CommandRecord {
            command: self.command.clone(),
            exit_code: self.termination.exit_code(),
            duration_ms: self.duration_ms,
        }
    }
}

/// Where and with what environment commands run.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub workdir: PathBuf,

    /// Added on top of the inherited process environment.
    pub env: BTreeMap<String, String>,

    /// Tag for streamed output lines (stage name, `fetch`, ...).
    pub label: String,
}

impl CommandContext {
    pub fn new(workdir: impl Into<PathBuf>, env: BTreeMap<String, String>) -> Self {
        Self {
            workdir: workdir.into(),
            env,
            label: String::new(),
        }
    }

    pub fn labelled(&self, label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..self.clone()
        }
    }
}

/// Run a shell command line.
pub async fn run_shell(
    command: &str,
    ctx: &CommandContext,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> CommandOutput {
    let args = ["-c".to_string(), command.to_string()];
    run_program("sh", &args, command, ctx, timeout, cancel).await
}

/// Run a program with arguments. `shown` is the command as recorded.
///
/// The command is finished once the leader has exited and its output
/// pipes are closed. Background children that keep the pipes open are
/// waited for, but the timeout and cancellation still apply to them.
pub async fn run_program(
    program: &str,
    args: &[String],
    shown: &str,
    ctx: &CommandContext,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> CommandOutput {
    let start = Instant::now();
    let finish = |termination, stdout, stderr| CommandOutput {
        command: shown.to_string(),
        termination,
        stdout,
        stderr,
        duration_ms: start.elapsed().as_millis() as u64,
    };

    if cancel.is_cancelled() {
        return finish(Termination::Cancelled, String::new(), String::new());
    }

    debug!(label = %ctx.label, command = %shown, "running command");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&ctx.workdir)
        .envs(&ctx.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return finish(
                Termination::SpawnFailed(e.to_string()),
                String::new(),
                e.to_string(),
            )
        }
    };
    // The leader's pid is the group id; `child.id()` is gone once it is reaped.
    let pgid = child.id();

    let drain = CancellationToken::new();
    let stdout_handle = child.stdout.take().map(|out| {
        tokio::spawn(collect_lines(out, ctx.label.clone(), "stdout", drain.clone()))
    });
    let stderr_handle = child.stderr.take().map(|err| {
        tokio::spawn(collect_lines(err, ctx.label.clone(), "stderr", drain.clone()))
    });

    enum ExitReason {
        Completed(std::process::ExitStatus),
        WaitError(std::io::Error),
        TimedOut,
        Cancelled,
    }

    let deadline = tokio::time::sleep(timeout.unwrap_or(Duration::MAX));
    tokio::pin!(deadline);
    let has_deadline = timeout.is_some();

    let exit_reason = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => ExitReason::Completed(status),
            Err(e) => ExitReason::WaitError(e),
        },
        _ = &mut deadline, if has_deadline => ExitReason::TimedOut,
        _ = cancel.cancelled() => ExitReason::Cancelled,
    };

    let mut leader_exited = false;
    let mut termination = match exit_reason {
        ExitReason::Completed(status) => {
            leader_exited = true;
            match status.code() {
                Some(code) => Termination::Exited(code),
                None => Termination::Signalled,
            }
        }
        ExitReason::WaitError(e) => {
            warn!(label = %ctx.label, error = %e, "waiting for command failed");
            terminate_process_group(&mut child, pgid, GRACE_PERIOD).await;
            Termination::Signalled
        }
        ExitReason::TimedOut => {
            warn!(label = %ctx.label, command = %shown, "command timed out");
            terminate_process_group(&mut child, pgid, GRACE_PERIOD).await;
            Termination::TimedOut
        }
        ExitReason::Cancelled => {
            debug!(label = %ctx.label, command = %shown, "command cancelled");
            terminate_process_group(&mut child, pgid, GRACE_PERIOD).await;
            Termination::Cancelled
        }
    };

    let output = join_output(stdout_handle, stderr_handle);
    tokio::pin!(output);

    let mut collected = None;
    let interrupted = if leader_exited {
        tokio::select! {
            out = output.as_mut() => {
                collected = Some(out);
                None
            }
            _ = &mut deadline, if has_deadline => Some(Termination::TimedOut),
            _ = cancel.cancelled() => Some(Termination::Cancelled),
        }
    } else {
        None
    };

    if let Some(reason) = interrupted {
        warn!(
            label = %ctx.label,
            command = %shown,
            reason = %reason.describe(),
            "background processes still hold the output, stopping them"
        );
        kill_group(pgid);
        termination = reason;
    }

    let (stdout, stderr) = match collected {
        Some(out) => out,
        // Children outside the group may keep the pipes open forever.
        None => match tokio::time::timeout(GRACE_PERIOD, output.as_mut()).await {
            Ok(out) => out,
            Err(_) => {
                drain.cancel();
                output.await
            }
        },
    };

    finish(termination, stdout, stderr)
}

async fn join_output(
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
) -> (String, String) {
    async fn join(handle: Option<JoinHandle<String>>) -> String {
        match handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        }
    }
    tokio::join!(join(stdout), join(stderr))
}

async fn collect_lines<R>(
    stream: R,
    label: String,
    stream_name: &'static str,
    drain: CancellationToken,
) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut collected = String::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            read = reader.read_until(b'\n', &mut buf) => read,
            _ = drain.cancelled() => break,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                let mut line = String::from_utf8_lossy(&buf).into_owned();
                if line.len() > MAX_LINE_LENGTH {
                    let mut cut = MAX_LINE_LENGTH;
                    while !line.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    line.truncate(cut);
                    line.push_str("... [truncated]\n");
                }
                debug!(label = %label, stream = stream_name, "{}", line.trim_end());
                collected.push_str(&line);
            }
            Err(e) => {
                warn!(label = %label, stream = stream_name, error = %e, "error reading output");
                break;
            }
        }
    }
    collected
}

/// SIGKILL whatever is left in the group.
#[cfg(unix)]
fn kill_group(pgid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = pgid else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        if e != Errno::ESRCH {
            warn!(pgid, error = ?e, "SIGKILL to process group failed");
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: Option<u32>) {}

/// SIGTERM the process group, wait out the grace period, then SIGKILL.
#[cfg(unix)]
async fn terminate_process_group(child: &mut Child, pgid: Option<u32>, grace: Duration) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(raw) = pgid else {
        return;
    };
    let group = Pid::from_raw(raw as i32);

    if let Err(e) = killpg(group, Signal::SIGTERM) {
        if e != Errno::ESRCH {
            warn!(pgid = raw, error = ?e, "SIGTERM to process group failed");
        }
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if child.try_wait().ok().flatten().is_some() {
            // Leader is gone; make sure stragglers in the group follow.
            kill_group(pgid);
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    kill_group(pgid);
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn terminate_process_group(child: &mut Child, _pgid: Option<u32>, _grace: Duration) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Runs the command sequence of a stage and classifies the outcome.
pub struct StageRunner;

impl StageRunner {
    /// Execute a stage. Commands run in order; the first failure ends it.
    ///
    /// `ctx.env` holds the pipeline variables; the stage's own environment
    /// is layered on top.
    pub async fn execute_stage(
        stage: &Stage,
        ctx: &CommandContext,
        cancel: &CancellationToken,
    ) -> StageResult {
        let start = Instant::now();
        let deadline = (stage.timeout_secs > 0)
            .then(|| start + Duration::from_secs(stage.timeout_secs));

        let mut stage_ctx = ctx.labelled(stage.name());
        stage_ctx
            .env
            .extend(stage.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut commands = Vec::new();
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut last = Termination::Exited(0);

        for command in &stage.script {
            if cancel.is_cancelled() {
                last = Termination::Cancelled;
                break;
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        last = Termination::TimedOut;
                        break;
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            let output = run_shell(command, &stage_ctx, remaining, cancel).await;
            stdout.push_str(&format!("$ {command}\n"));
            stdout.push_str(&output.stdout);
            stderr.push_str(&output.stderr);
            commands.push(output.record());

            let ok = output.success();
            last = output.termination;
            if !ok {
                break;
            }
        }

        classify(
            stage,
            ctx,
            commands,
            stdout,
            stderr,
            last,
            start.elapsed().as_millis() as u64,
        )
    }
}

fn classify(
    stage: &Stage,
    ctx: &CommandContext,
    commands: Vec<CommandRecord>,
    stdout: String,
    stderr: String,
    termination: Termination,
    duration_ms: u64,
) -> StageResult {
    let exit_code = termination.exit_code();

    let detail = match stage.kind {
        StageKind::Format => {
            StageDetail::Format(parse_format_report(&stdout, Some(&ctx.workdir)))
        }
        StageKind::Test => StageDetail::Test(parse_test_report(&stdout)),
        StageKind::Build => StageDetail::None,
    };

    let (outcome, failure) = if termination.success() {
        (StageOutcome::Passed, None)
    } else if termination == Termination::Cancelled {
        (StageOutcome::Cancelled, None)
    } else {
        let reason = match commands.last() {
            Some(last) => format!("`{}`: {}", last.command, termination.describe()),
            None => termination.describe(),
        };
        let failure = match &detail {
            StageDetail::Format(report) => StageFailure::FormatViolation {
                files: report.paths(),
            },
            StageDetail::Test(report) => StageFailure::TestFailure {
                exit_code,
                failed: report.failed_names(),
                reason,
            },
            StageDetail::None => StageFailure::BuildError { exit_code, reason },
        };
        let outcome = if stage.is_blocking() {
            StageOutcome::Failed
        } else {
            StageOutcome::AdvisoryFailed
        };
        (outcome, Some(failure))
    };

    StageResult {
        stage: stage.kind,
        exit_code,
        blocking: stage.is_blocking(),
        outcome,
        failure,
        commands,
        stdout,
        stderr,
        duration_ms,
        detail,
    }
}
