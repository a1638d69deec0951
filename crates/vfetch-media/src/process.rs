//! External process runner with hard deadlines.
//!
//! Every invocation runs in its own process group with stdin closed and its
//! working directory pinned to the job workspace. On timeout or cancellation
//! the whole group receives SIGTERM, then SIGKILL after a grace period, and
//! the child is reaped before `run` returns. After a normal exit the group is
//! SIGKILLed as well, so helpers spawned by the tool (e.g. FFmpeg forked by
//! yt-dlp) never outlive the call.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{MediaError, MediaResult};

/// Default capture bound per output stream.
pub const DEFAULT_OUTPUT_LIMIT: usize = 64 * 1024;

/// Default SIGTERM -> SIGKILL grace period.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// Number of stderr lines attached to stage failures.
pub const STDERR_TAIL_LINES: usize = 20;

/// Kernel-enforced limits applied to the child before exec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// RLIMIT_FSIZE: largest file the process may write, in bytes
    pub max_file_size: Option<u64>,
    /// RLIMIT_CPU: CPU seconds
    pub cpu_seconds: Option<u64>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.max_file_size.is_none() && self.cpu_seconds.is_none()
    }
}

/// Description of one external command.
///
/// Arguments are kept as a list and handed to `execve` unchanged; nothing is
/// ever interpreted by a shell.
#[derive(Debug, Clone)]
pub struct Invocation {
    program: PathBuf,
    args: Vec<OsString>,
    working_dir: PathBuf,
    timeout: Duration,
    output_limit: usize,
    kill_grace: Duration,
    limits: ResourceLimits,
    envs: Vec<(OsString, OsString)>,
}

impl Invocation {
    /// Create a new invocation of `program` running inside `working_dir`.
    pub fn new(program: impl Into<PathBuf>, working_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            timeout,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            kill_grace: DEFAULT_KILL_GRACE,
            limits: ResourceLimits::default(),
            envs: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Bound on captured bytes per stream.
    pub fn output_limit(mut self, bytes: usize) -> Self {
        self.output_limit = bytes;
        self
    }

    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn argv(&self) -> &[OsString] {
        &self.args
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Short program name for logs and errors.
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .into_owned()
    }

    /// Human-readable command line (logging only).
    pub fn display_command(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().into_owned()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }
}

/// Bounded capture of one output stream. Keeps the most recent bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    bytes: Vec<u8>,
    discarded: u64,
}

impl CapturedOutput {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Bytes dropped because the stream exceeded the capture bound.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn is_truncated(&self) -> bool {
        self.discarded > 0
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// Last `n` non-empty lines.
    pub fn tail_lines(&self, n: usize) -> String {
        let text = self.text();
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }
}

/// Ring buffer that drops the oldest bytes once `limit` is reached.
#[derive(Debug)]
struct TailBuffer {
    buf: VecDeque<u8>,
    limit: usize,
    discarded: u64,
}

impl TailBuffer {
    fn new(limit: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(limit.min(8192)),
            limit,
            discarded: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.limit {
            self.discarded += (self.buf.len() + chunk.len() - self.limit) as u64;
            self.buf.clear();
            self.buf.extend(&chunk[chunk.len() - self.limit..]);
            return;
        }
        let overflow = (self.buf.len() + chunk.len()).saturating_sub(self.limit);
        self.buf.drain(..overflow);
        self.discarded += overflow as u64;
        self.buf.extend(chunk);
    }

    fn finish(self) -> CapturedOutput {
        CapturedOutput {
            bytes: self.buf.into_iter().collect(),
            discarded: self.discarded,
        }
    }
}

/// Result of a process that exited on its own.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub program: String,
    pub exit_code: i32,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Exit code 0 and, when given, a non-empty `expected` file are the only
    /// success condition. Anything else becomes `StageFailed` carrying the
    /// stderr tail.
    pub fn require_success(&self, expected: Option<&Path>) -> MediaResult<()> {
        if !self.success() {
            return Err(MediaError::stage_failed(
                &self.program,
                format!("exited with status {}", self.exit_code),
                Some(self.exit_code),
                Some(self.stderr.tail_lines(STDERR_TAIL_LINES)),
            ));
        }
        if let Some(path) = expected {
            let present = std::fs::metadata(path)
                .map(|m| m.is_file() && m.len() > 0)
                .unwrap_or(false);
            if !present {
                return Err(MediaError::stage_failed(
                    &self.program,
                    format!("expected output {} is missing or empty", path.display()),
                    Some(self.exit_code),
                    Some(self.stderr.tail_lines(STDERR_TAIL_LINES)),
                ));
            }
        }
        Ok(())
    }
}

enum WaitOutcome {
    Exited(ExitStatus),
    WaitFailed(std::io::Error),
    TimedOut,
    Cancelled,
}

/// Runner for external commands with timeout and cancellation.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    /// Cancellation signal receiver
    cancel_rx: Option<watch::Receiver<bool>>,
}

impl ProcessRunner {
    /// Create a new runner.
    pub fn new() -> Self {
        Self { cancel_rx: None }
    }

    /// Set cancellation signal. Sending `true` terminates the running process.
    pub fn with_cancel(mut self, cancel_rx: watch::Receiver<bool>) -> Self {
        self.cancel_rx = Some(cancel_rx);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Run an invocation to completion.
    ///
    /// Returns the exit code and captured output for any normal exit,
    /// including nonzero ones. Fails with `LaunchFailure`, `Timeout`,
    /// `Killed` (cancellation or signal) or `ResourceExhausted` (SIGXFSZ).
    pub async fn run(&self, invocation: &Invocation) -> MediaResult<ProcessOutput> {
        let program = invocation.program_name();

        if !invocation.working_dir.is_dir() {
            return Err(MediaError::internal(format!(
                "working directory {} does not exist",
                invocation.working_dir.display()
            )));
        }
        if self.is_cancelled() {
            return Err(MediaError::Killed { program, signal: None });
        }

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &invocation.envs {
            command.env(key, value);
        }
        isolate(&mut command, invocation.limits);

        debug!(program = %program, "Running: {}", invocation.display_command());
        let started = Instant::now();

        let mut child = command.spawn().map_err(|e| {
            let reason = match e.kind() {
                std::io::ErrorKind::NotFound => "binary not found".to_string(),
                std::io::ErrorKind::PermissionDenied => "binary is not executable".to_string(),
                _ => e.to_string(),
            };
            MediaError::launch_failure(&program, reason)
        })?;
        let pid = child.id();
        // Backstop for when this future is dropped before the child is reaped.
        let _group_guard = scopeguard::guard(pid, |pid| signal_group(pid, GroupSignal::Kill));

        let stdout_task = child
            .stdout
            .take()
            .map(|s| tokio::spawn(capture(s, invocation.output_limit)));
        let stderr_task = child
            .stderr
            .take()
            .map(|s| tokio::spawn(capture(s, invocation.output_limit)));

        let outcome = self.wait_for_completion(&mut child, invocation.timeout).await;

        let status = match outcome {
            WaitOutcome::Exited(status) => {
                signal_group(pid, GroupSignal::Kill);
                Ok(status)
            }
            WaitOutcome::TimedOut => {
                warn!(
                    program = %program,
                    timeout_secs = invocation.timeout.as_secs_f64(),
                    "Process timed out, terminating process group"
                );
                terminate(&mut child, pid, invocation.kill_grace).await;
                Err(MediaError::Timeout {
                    program: program.clone(),
                    secs: invocation.timeout.as_secs(),
                })
            }
            WaitOutcome::Cancelled => {
                info!(program = %program, "Process cancelled, terminating process group");
                terminate(&mut child, pid, invocation.kill_grace).await;
                Err(MediaError::Killed {
                    program: program.clone(),
                    signal: None,
                })
            }
            WaitOutcome::WaitFailed(e) => {
                terminate(&mut child, pid, invocation.kill_grace).await;
                Err(MediaError::Io(e))
            }
        };

        let stdout = join_capture(stdout_task, invocation.kill_grace).await;
        let stderr = join_capture(stderr_task, invocation.kill_grace).await;
        let elapsed = started.elapsed();

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                debug!(program = %program, stderr = %stderr.tail_lines(5), "Process did not exit cleanly");
                return Err(e);
            }
        };
        let exit_code = classify_exit(&program, status)?;

        debug!(
            program = %program,
            exit_code,
            elapsed_ms = elapsed.as_millis() as u64,
            stdout_discarded = stdout.discarded(),
            stderr_discarded = stderr.discarded(),
            "Process exited"
        );

        Ok(ProcessOutput {
            program,
            exit_code,
            stdout,
            stderr,
            elapsed,
        })
    }

    /// Wait for child process with cancellation and timeout.
    async fn wait_for_completion(&self, child: &mut Child, timeout: Duration) -> WaitOutcome {
        let mut cancel_rx = self.cancel_rx.clone();
        let cancelled = async move {
            match cancel_rx.as_mut() {
                Some(rx) => {
                    // A dropped sender means nobody can cancel any more.
                    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = child.wait() => match result {
                Ok(status) => WaitOutcome::Exited(status),
                Err(e) => WaitOutcome::WaitFailed(e),
            },
            _ = tokio::time::sleep(timeout) => WaitOutcome::TimedOut,
            _ = cancelled => WaitOutcome::Cancelled,
        }
    }
}

async fn capture<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> CapturedOutput {
    let mut tail = TailBuffer::new(limit);
    let mut chunk = vec![0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => tail.push(&chunk[..n]),
            Err(e) => {
                debug!("Output stream read failed: {}", e);
                break;
            }
        }
    }
    tail.finish()
}

/// Collect a capture task. Pipes held open by a stray descendant must not
/// block the caller, so the task is aborted after `grace`.
async fn join_capture(task: Option<JoinHandle<CapturedOutput>>, grace: Duration) -> CapturedOutput {
    let Some(mut task) = task else {
        return CapturedOutput::default();
    };
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!("Output capture task failed: {}", e);
            CapturedOutput::default()
        }
        Err(_) => {
            task.abort();
            warn!("Output capture did not finish after process exit, discarding");
            CapturedOutput::default()
        }
    }
}

/// SIGTERM the group, escalate to SIGKILL after `grace`, then reap.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    signal_group(pid, GroupSignal::Terminate);
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!(pid = ?pid, "Process ignored SIGTERM, sending SIGKILL");
    }
    signal_group(pid, GroupSignal::Kill);
    // Covers platforms without process groups and guarantees the child is reaped.
    let _ = child.start_kill();
    if let Err(e) = child.wait().await {
        warn!(pid = ?pid, "Failed to reap terminated process: {}", e);
    }
}

fn classify_exit(program: &str, status: ExitStatus) -> MediaResult<i32> {
    if let Some(code) = status.code() {
        return Ok(code);
    }
    #[cfg(unix)]
    {
        use nix::sys::signal::Signal;
        use std::os::unix::process::ExitStatusExt;

        if let Some(signal) = status.signal() {
            if signal == Signal::SIGXFSZ as i32 {
                return Err(MediaError::resource_exhausted(format!(
                    "{program} exceeded the per-job file size limit"
                )));
            }
            return Err(MediaError::Killed {
                program: program.to_string(),
                signal: Some(signal),
            });
        }
    }
    Err(MediaError::Killed {
        program: program.to_string(),
        signal: None,
    })
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// Place the child in its own process group and apply rlimits.
#[cfg(unix)]
fn isolate(command: &mut Command, limits: ResourceLimits) {
    use nix::sys::resource::{setrlimit, Resource};
    use std::os::unix::process::CommandExt;

    command.as_std_mut().process_group(0);

    if limits.is_empty() {
        return;
    }
    // SAFETY: the hook only calls setrlimit(2), which is async-signal-safe
    // and does not allocate.
    unsafe {
        command.as_std_mut().pre_exec(move || {
            if let Some(bytes) = limits.max_file_size {
                setrlimit(Resource::RLIMIT_FSIZE, bytes, bytes)?;
            }
            if let Some(secs) = limits.cpu_seconds {
                setrlimit(Resource::RLIMIT_CPU, secs, secs)?;
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn isolate(_command: &mut Command, _limits: ResourceLimits) {}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: GroupSignal) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) => debug!(pgid = raw, signal = ?signal, "Signalled process group"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid = raw, signal = ?signal, "Failed to signal process group: {}", e),
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: GroupSignal) {}
