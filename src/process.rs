//! Child process launching and output capture.
//!
//! Every test execution and every host-tool invocation (adb, qemu, `file`)
//! goes through [`launch`]. The launcher:
//!
//! - spawns the program with an explicit argument vector, environment and
//!   working directory
//! - drains stdout and stderr concurrently with waiting for exit, so a chatty
//!   child can never deadlock on a full pipe
//! - keeps at most `output_cap` bytes per stream, appending a truncation
//!   marker when more was produced
//! - enforces a per-process timeout and an external cancellation token,
//!   killing the whole process group before returning
//! - treats the exit of the child as the end of the run: anything left in
//!   its process group is killed and the pipes get a short grace period
//!
//! ```text
//!   Command ──► spawn ──┬── read stdout (capped) ──┐
//!                       ├── read stderr (capped) ──┼──► ProcessOutput
//!                       └── wait() ────────────────┘
//!                              ▲
//!              timeout / cancel┘ (kill process group, reap)
//! ```

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default per-stream capture limit (4 MiB).
pub const DEFAULT_OUTPUT_CAP: usize = 4 * 1024 * 1024;

/// How long output is still collected after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Result type for process operations.
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Errors raised while launching or waiting on a child process.
///
/// A process that runs and exits non-zero is NOT an error; see
/// [`Termination`].
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The program could not be started (missing, not executable, ...).
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A pipe was not set up on the child.
    #[error("Failed to capture {0} of child process")]
    Capture(&'static str),

    /// Waiting for the child failed.
    #[error("Failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A host tool did not finish in time.
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

/// A fully composed command line: program, arguments, environment and
/// working directory.
///
/// Profiles produce a `Command` for each test; the launcher consumes it.
///
/// # Example
///
/// ```
/// use targetrun::process::Command;
///
/// let cmd = Command::new("adb")
///     .args(["-s", "emulator-5554", "shell"])
///     .arg("cd /data/local/tmp && ./t1")
///     .env("ANDROID_ADB_SERVER_PORT", "5037");
///
/// assert_eq!(cmd.program, "adb");
/// assert_eq!(cmd.args.len(), 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The program to execute.
    pub program: String,

    /// Arguments passed to the program.
    pub args: Vec<String>,

    /// Environment variables set on top of the inherited environment.
    pub env: Vec<(String, String)>,

    /// Working directory. `None` inherits the runner's directory.
    pub working_dir: Option<PathBuf>,
}

impl Command {
    /// Creates a command for the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
        }
    }

    /// Adds a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Prepends a wrapper (e.g. an emulator invocation) to this command.
    ///
    /// `wrapper[0]` becomes the program; the remaining wrapper words and the
    /// original program come before the original arguments.
    pub fn wrapped(self, wrapper: &[String]) -> Self {
        let Some((program, leading)) = wrapper.split_first() else {
            return self;
        };
        let mut args = leading.to_vec();
        args.push(self.program);
        args.extend(self.args);
        Self {
            program: program.clone(),
            args,
            env: self.env,
            working_dir: self.working_dir,
        }
    }

    /// Renders the command as a shell-quoted string, for logs and listings.
    ///
    /// ```
    /// use targetrun::process::Command;
    /// let cmd = Command::new("echo").arg("hello world");
    /// assert_eq!(cmd.to_shell_string(), "echo 'hello world'");
    /// ```
    pub fn to_shell_string(&self) -> String {
        let mut parts = vec![shell_quote(&self.program)];
        for arg in &self.args {
            parts.push(shell_quote(arg));
        }
        parts.join(" ")
    }
}

/// Quotes a string for a POSIX shell, leaving plain words untouched.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | ',' | '+' | '@' | '%')
        })
    {
        s.to_string()
    } else {
        always_quote(s)
    }
}

/// Single-quotes a string for a POSIX shell unconditionally.
pub fn always_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Limits applied to one launch.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Kill the process if it runs longer than this.
    pub timeout: Option<Duration>,

    /// Maximum bytes kept per output stream.
    pub output_cap: usize,

    /// Cancelling this token kills the process.
    pub cancel: CancellationToken,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            output_cap: DEFAULT_OUTPUT_CAP,
            cancel: CancellationToken::new(),
        }
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own with this status code.
    Exited(i32),
    /// Killed by this signal (Unix).
    Signaled(i32),
    /// Killed by the launcher after the timeout expired.
    TimedOut,
    /// Killed by the launcher after cancellation.
    Cancelled,
    /// The platform reported neither a code nor a signal.
    Unknown,
}

/// Everything observed about one finished child process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub termination: Termination,
    pub stdout: String,
    pub stderr: String,
    /// Whether either stream hit the capture limit.
    pub truncated: bool,
    pub duration: Duration,
    /// OS process id, if the child was started.
    pub pid: Option<u32>,
}

/// Output of a host-tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Byte buffer that keeps the first `cap` bytes and counts the rest.
struct CappedBuffer {
    data: Vec<u8>,
    cap: usize,
    dropped: usize,
}

impl CappedBuffer {
    fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            dropped: 0,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        let room = self.cap.saturating_sub(self.data.len());
        let keep = room.min(bytes.len());
        self.data.extend_from_slice(&bytes[..keep]);
        self.dropped += bytes.len() - keep;
    }

    /// Reads until EOF. Bytes past the cap are still consumed.
    async fn fill_from<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> std::io::Result<()> {
        let mut chunk = [0u8; 8192];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            self.push(&chunk[..n]);
        }
    }

    fn truncated(&self) -> bool {
        self.dropped > 0
    }

    fn into_string(self) -> String {
        let mut text = String::from_utf8_lossy(&self.data).into_owned();
        if self.dropped > 0 {
            if !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&format!(
                "[... output truncated after {} bytes, {} bytes dropped ...]\n",
                self.cap, self.dropped
            ));
        }
        text
    }
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Spawns `cmd` and waits for it under the given limits.
///
/// # Errors
///
/// Only spawn and wait failures are errors. Non-zero exits, signals,
/// timeouts and cancellation are reported through
/// [`ProcessOutput::termination`].
pub async fn launch(cmd: &Command, options: &LaunchOptions) -> ProcessResult<ProcessOutput> {
    let start = Instant::now();

    let mut process = tokio::process::Command::new(&cmd.program);
    process.args(&cmd.args);
    for (key, value) in &cmd.env {
        process.env(key, value);
    }
    if let Some(dir) = &cmd.working_dir {
        process.current_dir(dir);
    }
    process.stdin(Stdio::null());
    process.stdout(Stdio::piped());
    process.stderr(Stdio::piped());
    process.kill_on_drop(true);
    #[cfg(unix)]
    process.process_group(0);

    let mut child = process.spawn().map_err(|source| ProcessError::Spawn {
        program: cmd.program.clone(),
        source,
    })?;
    let pid = child.id();
    debug!(pid, program = %cmd.program, "Spawned child process");

    let mut stdout = child
        .stdout
        .take()
        .ok_or(ProcessError::Capture("stdout"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or(ProcessError::Capture("stderr"))?;

    let mut out_buf = CappedBuffer::new(options.output_cap);
    let mut err_buf = CappedBuffer::new(options.output_cap);

    let termination = {
        let drain = async {
            let (out_res, err_res) = tokio::join!(
                out_buf.fill_from(&mut stdout),
                err_buf.fill_from(&mut stderr),
            );
            if let Err(e) = out_res.and(err_res) {
                debug!("Error reading child output: {}", e);
            }
        };
        tokio::pin!(drain);

        let deadline = async {
            match options.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        // Exit of the child ends the wait; open pipes do not.
        let mut drained = false;
        let waited = loop {
            tokio::select! {
                () = &mut drain, if !drained => drained = true,
                status = child.wait() => break Waited::Exited(status),
                () = &mut deadline => break Waited::TimedOut,
                () = options.cancel.cancelled() => break Waited::Cancelled,
            }
        };

        let termination = match waited {
            Waited::Exited(status) => {
                let status = status.map_err(|source| ProcessError::Wait {
                    program: cmd.program.clone(),
                    source,
                })?;
                // Background processes the test left behind.
                kill_process_group(pid);
                termination_from_status(status)
            }
            Waited::TimedOut => {
                debug!(pid, "Timeout expired, killing process group");
                terminate(&mut child, &cmd.program).await?;
                Termination::TimedOut
            }
            Waited::Cancelled => {
                debug!(pid, "Cancelled, killing process group");
                terminate(&mut child, &cmd.program).await?;
                Termination::Cancelled
            }
        };

        if !drained && tokio::time::timeout(DRAIN_GRACE, &mut drain).await.is_err() {
            debug!(pid, "Output pipes still open after exit, dropping the rest");
        }
        termination
    };

    let truncated = out_buf.truncated() || err_buf.truncated();
    Ok(ProcessOutput {
        termination,
        stdout: out_buf.into_string(),
        stderr: err_buf.into_string(),
        truncated,
        duration: start.elapsed(),
        pid,
    })
}

/// Runs a host tool to completion and returns its exit code and output.
///
/// A timeout is an error here: callers of host tools need an answer.
pub async fn run_tool(cmd: &Command, timeout: Duration) -> ProcessResult<ToolOutput> {
    let options = LaunchOptions {
        timeout: Some(timeout),
        ..Default::default()
    };
    let output = launch(cmd, &options).await?;
    match output.termination {
        Termination::TimedOut | Termination::Cancelled => Err(ProcessError::Timeout {
            program: cmd.program.clone(),
            timeout,
        }),
        Termination::Exited(code) => Ok(ToolOutput {
            exit_code: Some(code),
            stdout: output.stdout,
            stderr: output.stderr,
        }),
        Termination::Signaled(_) | Termination::Unknown => Ok(ToolOutput {
            exit_code: None,
            stdout: output.stdout,
            stderr: output.stderr,
        }),
    }
}

/// Sends SIGKILL to the process group led by `pid`.
///
/// The child leads its own group, so this reaches any grandchildren.
fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: kill(2) has no memory-safety preconditions.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Kills the child's process group and reaps the child.
async fn terminate(child: &mut Child, program: &str) -> ProcessResult<()> {
    kill_process_group(child.id());
    if let Err(e) = child.start_kill() {
        // Already exited between the timeout firing and the kill.
        debug!("start_kill failed: {}", e);
    }
    match child.wait().await {
        Ok(_) => Ok(()),
        Err(source) => {
            warn!("Failed to reap {} after kill: {}", program, source);
            Err(ProcessError::Wait {
                program: program.to_string(),
                source,
            })
        }
    }
}

fn termination_from_status(status: ExitStatus) -> Termination {
    if let Some(code) = status.code() {
        return Termination::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Termination::Signaled(signal);
        }
    }
    Termination::Unknown
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        Command::new("/bin/sh").arg("-c").arg(script)
    }

    /// Whether `pid` exists and is not a zombie waiting for its reaper.
    fn is_running(pid: libc::pid_t) -> bool {
        if unsafe { libc::kill(pid, 0) } != 0 {
            return false;
        }
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(") ")
                .is_none_or(|(_, rest)| !rest.starts_with('Z')),
            Err(_) => !std::path::Path::new("/proc/self").exists(),
        }
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let output = launch(&sh("echo out; echo err >&2; exit 3"), &LaunchOptions::default())
            .await
            .unwrap();

        assert_eq!(output.termination, Termination::Exited(3));
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert!(!output.truncated);
    }

    #[tokio::test]
    async fn test_env_and_working_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let cmd = sh("echo $TARGETRUN_PROBE; pwd")
            .env("TARGETRUN_PROBE", "hello")
            .working_dir(dir.path());

        let output = launch(&cmd, &LaunchOptions::default()).await.unwrap();
        let mut lines = output.stdout.lines();
        assert_eq!(lines.next(), Some("hello"));
        let pwd = PathBuf::from(lines.next().unwrap());
        assert_eq!(
            pwd.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error() {
        let err = launch(
            &Command::new("/nonexistent/targetrun-test-binary"),
            &LaunchOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_signal_termination() {
        let output = launch(&sh("kill -SEGV $$"), &LaunchOptions::default())
            .await
            .unwrap();
        assert_eq!(output.termination, Termination::Signaled(libc::SIGSEGV));
    }

    #[tokio::test]
    async fn test_output_is_truncated_without_blocking() {
        // Far more than a pipe buffer, far more than the cap.
        let options = LaunchOptions {
            output_cap: 1000,
            ..Default::default()
        };
        let output = launch(
            &sh("i=0; while [ $i -lt 20000 ]; do echo 0123456789abcdef; i=$((i+1)); done"),
            &options,
        )
        .await
        .unwrap();

        assert_eq!(output.termination, Termination::Exited(0));
        assert!(output.truncated);
        assert!(output.stdout.starts_with("0123456789abcdef\n"));
        assert!(output.stdout.contains("[... output truncated after 1000 bytes"));
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let options = LaunchOptions {
            timeout: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let start = Instant::now();
        let output = launch(&sh("echo started; sleep 30"), &options).await.unwrap();

        assert_eq!(output.termination, Termination::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(10));

        // The child has been reaped, so the pid no longer exists.
        let pid = output.pid.unwrap() as libc::pid_t;
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        assert!(!alive);
    }

    #[tokio::test]
    async fn test_exit_with_background_holder() {
        let options = LaunchOptions {
            timeout: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        let start = Instant::now();
        let output = launch(&sh("sleep 20 & echo done; exit 0"), &options)
            .await
            .unwrap();

        assert_eq!(output.termination, Termination::Exited(0));
        assert_eq!(output.stdout, "done\n");
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_exit_without_timeout_kills_leftovers() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("bg.pid");
        let script = format!(
            "sleep 20 >/dev/null 2>&1 & echo $! > {}; exit 0",
            pid_file.display()
        );

        let output = launch(&sh(&script), &LaunchOptions::default())
            .await
            .unwrap();
        assert_eq!(output.termination, Termination::Exited(0));

        let bg: libc::pid_t = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        // SIGKILL is asynchronous; give the kernel a moment.
        let mut alive = true;
        for _ in 0..50 {
            alive = is_running(bg);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive);
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let token = CancellationToken::new();
        let options = LaunchOptions {
            cancel: token.clone(),
            ..Default::default()
        };

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        let output = launch(&sh("sleep 30"), &options).await.unwrap();
        canceller.await.unwrap();
        assert_eq!(output.termination, Termination::Cancelled);
    }

    #[tokio::test]
    async fn test_run_tool_timeout_is_error() {
        let err = run_tool(&sh("sleep 30"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Timeout { .. }));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/data/local/tmp"), "/data/local/tmp");
        assert_eq!(shell_quote("-x"), "-x");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("$(reboot)"), "'$(reboot)'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_wrapped() {
        let cmd = Command::new("/tools/file")
            .arg("-b")
            .wrapped(&["qemu-x86_64".to_string(), "-L".to_string(), "/sysroot".to_string()]);
        assert_eq!(cmd.program, "qemu-x86_64");
        assert_eq!(cmd.args, vec!["-L", "/sysroot", "/tools/file", "-b"]);
    }
}
