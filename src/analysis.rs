//! Classification of finished processes into test outcomes.
//!
//! The classifier looks at how the process terminated and at its captured
//! output:
//!
//! | Termination | Output | Outcome |
//! |---|---|---|
//! | timeout | - | `TimedOut` |
//! | crash signal | - | `Crashed(signal)` |
//! | other signal | - | `Failed` |
//! | exit 0 | crash signature | `Crashed(signal)` |
//! | exit 0 | clean | `Passed` |
//! | exit != 0 | crash signature | `Crashed(signal)` |
//! | exit != 0 | clean | `Failed(stderr)` |
//! | unknown | - | `Failed` (never `Passed`) |
//!
//! Transports that run the test under a remote shell (ADB) report a signal
//! death as exit status `128 + N`; [`OutputAnalyzer::with_shell_exit_codes`]
//! decodes those back into signals.

use std::fmt;

use regex::Regex;
use serde::Serialize;

use crate::process::{ProcessOutput, Termination};

/// Linux signal numbers, used for remote targets regardless of host OS.
pub mod signal {
    pub const SIGILL: i32 = 4;
    pub const SIGTRAP: i32 = 5;
    pub const SIGABRT: i32 = 6;
    pub const SIGBUS: i32 = 7;
    pub const SIGFPE: i32 = 8;
    pub const SIGSEGV: i32 = 11;
    pub const SIGSYS: i32 = 31;
}

const LINUX_CRASH_SIGNALS: [i32; 7] = [
    signal::SIGILL,
    signal::SIGTRAP,
    signal::SIGABRT,
    signal::SIGBUS,
    signal::SIGFPE,
    signal::SIGSEGV,
    signal::SIGSYS,
];

/// Final classification of one test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    /// Non-zero exit; carries the failure reason (usually stderr).
    Failed(String),
    TimedOut,
    /// Abnormal termination by this signal.
    Crashed(i32),
    /// The runner could not execute the test.
    ToolError(String),
}

impl Outcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Passed => OutcomeKind::Passed,
            Outcome::Failed(_) => OutcomeKind::Failed,
            Outcome::TimedOut => OutcomeKind::TimedOut,
            Outcome::Crashed(_) => OutcomeKind::Crashed,
            Outcome::ToolError(_) => OutcomeKind::ToolError,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Passed)
    }

    /// One-line human description.
    pub fn message(&self) -> Option<String> {
        match self {
            Outcome::Passed => None,
            Outcome::Failed(reason) => Some(reason.clone()),
            Outcome::TimedOut => Some("test timed out".to_string()),
            Outcome::Crashed(sig) => Some(format!("crashed with signal {}", sig)),
            Outcome::ToolError(msg) => Some(msg.clone()),
        }
    }
}

/// Discriminant of [`Outcome`], used for counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Passed,
    Failed,
    TimedOut,
    Crashed,
    ToolError,
}

impl OutcomeKind {
    pub const ALL: [OutcomeKind; 5] = [
        OutcomeKind::Passed,
        OutcomeKind::Failed,
        OutcomeKind::TimedOut,
        OutcomeKind::Crashed,
        OutcomeKind::ToolError,
    ];
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutcomeKind::Passed => "passed",
            OutcomeKind::Failed => "failed",
            OutcomeKind::TimedOut => "timed out",
            OutcomeKind::Crashed => "crashed",
            OutcomeKind::ToolError => "tool error",
        };
        f.write_str(s)
    }
}

/// A pattern in test output that means the test crashed, whatever its
/// exit status says.
#[derive(Debug, Clone)]
pub struct CrashSignature {
    pub name: &'static str,
    pattern: Regex,
    /// Signal to report; overridden by a `sig` capture group if present.
    signal: i32,
}

impl CrashSignature {
    /// Creates a signature. Returns `None` if the pattern is invalid.
    pub fn new(name: &'static str, pattern: &str, signal: i32) -> Option<Self> {
        Regex::new(pattern).ok().map(|pattern| Self {
            name,
            pattern,
            signal,
        })
    }

    fn find(&self, text: &str) -> Option<i32> {
        let caps = self.pattern.captures(text)?;
        Some(
            caps.name("sig")
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(self.signal),
        )
    }
}

fn default_signatures() -> Vec<CrashSignature> {
    [
        (
            "sanitizer",
            r"==\d+==\s*ERROR: (Address|HWAddress|Memory|Thread|Leak)Sanitizer",
            signal::SIGABRT,
        ),
        ("ubsan", r": runtime error: ", signal::SIGABRT),
        (
            "qemu-target-signal",
            r"qemu: uncaught target signal (?P<sig>\d+)",
            signal::SIGSEGV,
        ),
        ("android-fatal-signal", r"Fatal signal (?P<sig>\d+) \(SIG", signal::SIGSEGV),
        (
            "shell-segfault",
            r"(?m)^(.*: )?Segmentation fault( \(core dumped\))?\s*$",
            signal::SIGSEGV,
        ),
        ("shell-abort", r"(?m)^(.*: )?Aborted( \(core dumped\))?\s*$", signal::SIGABRT),
        ("shell-bus-error", r"(?m)^(.*: )?Bus error( \(core dumped\))?\s*$", signal::SIGBUS),
        (
            "shell-illegal-instruction",
            r"(?m)^(.*: )?Illegal instruction( \(core dumped\))?\s*$",
            signal::SIGILL,
        ),
    ]
    .into_iter()
    .filter_map(|(name, pattern, sig)| CrashSignature::new(name, pattern, sig))
    .collect()
}

/// Turns [`ProcessOutput`] into an [`Outcome`].
#[derive(Debug, Clone)]
pub struct OutputAnalyzer {
    signatures: Vec<CrashSignature>,
    shell_exit_codes: bool,
}

impl Default for OutputAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputAnalyzer {
    /// Creates an analyzer with the built-in crash signatures.
    pub fn new() -> Self {
        Self {
            signatures: default_signatures(),
            shell_exit_codes: false,
        }
    }

    /// Decode `128 + N` exit codes as death by signal `N` (Linux numbering).
    pub fn with_shell_exit_codes(mut self, enabled: bool) -> Self {
        self.shell_exit_codes = enabled;
        self
    }

    /// Adds an extra crash signature.
    pub fn with_signature(mut self, signature: CrashSignature) -> Self {
        self.signatures.push(signature);
        self
    }

    /// Returns the first crash signature found in the output, if any.
    pub fn find_crash(&self, output: &ProcessOutput) -> Option<(&'static str, i32)> {
        self.signatures.iter().find_map(|sig| {
            sig.find(&output.stderr)
                .or_else(|| sig.find(&output.stdout))
                .map(|signal| (sig.name, signal))
        })
    }

    /// Classifies a finished process.
    pub fn classify(&self, output: &ProcessOutput) -> Outcome {
        match output.termination {
            Termination::TimedOut => Outcome::TimedOut,
            Termination::Cancelled => Outcome::ToolError("interrupted".to_string()),
            Termination::Signaled(sig) => self.classify_signal(sig, is_local_crash_signal(sig)),
            Termination::Exited(code) if self.shell_exit_codes && (129..=192).contains(&code) => {
                let sig = code - 128;
                self.classify_signal(sig, LINUX_CRASH_SIGNALS.contains(&sig))
            }
            Termination::Exited(code) => {
                if let Some((_, sig)) = self.find_crash(output) {
                    return Outcome::Crashed(sig);
                }
                if code == 0 {
                    Outcome::Passed
                } else {
                    Outcome::Failed(failure_reason(output, code))
                }
            }
            Termination::Unknown => Outcome::Failed(
                "could not classify process termination (no exit code or signal)".to_string(),
            ),
        }
    }

    fn classify_signal(&self, sig: i32, crash: bool) -> Outcome {
        if crash {
            Outcome::Crashed(sig)
        } else {
            Outcome::Failed(format!("terminated by signal {}", sig))
        }
    }
}

fn is_local_crash_signal(sig: i32) -> bool {
    #[cfg(unix)]
    {
        [
            libc::SIGILL,
            libc::SIGTRAP,
            libc::SIGABRT,
            libc::SIGBUS,
            libc::SIGFPE,
            libc::SIGSEGV,
            libc::SIGSYS,
        ]
        .contains(&sig)
    }
    #[cfg(not(unix))]
    {
        LINUX_CRASH_SIGNALS.contains(&sig)
    }
}

fn failure_reason(output: &ProcessOutput, code: i32) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        format!("exited with code {}", code)
    } else {
        stderr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn output(termination: Termination, stdout: &str, stderr: &str) -> ProcessOutput {
        ProcessOutput {
            termination,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            truncated: false,
            duration: Duration::from_millis(5),
            pid: None,
        }
    }

    #[test]
    fn test_clean_exit_passes() {
        let analyzer = OutputAnalyzer::new();
        let out = output(Termination::Exited(0), "ok\n", "");
        assert_eq!(analyzer.classify(&out), Outcome::Passed);
    }

    #[test]
    fn test_nonzero_exit_carries_stderr() {
        let analyzer = OutputAnalyzer::new();
        let out = output(Termination::Exited(1), "", "assertion failed: x == 2\n");
        assert_eq!(
            analyzer.classify(&out),
            Outcome::Failed("assertion failed: x == 2".to_string())
        );

        let silent = output(Termination::Exited(2), "", "");
        assert_eq!(
            analyzer.classify(&silent),
            Outcome::Failed("exited with code 2".to_string())
        );
    }

    #[test]
    fn test_sanitizer_report_overrides_zero_exit() {
        let analyzer = OutputAnalyzer::new();
        let out = output(
            Termination::Exited(0),
            "",
            "==4242==ERROR: AddressSanitizer: heap-use-after-free on address 0x6020",
        );
        assert_eq!(analyzer.classify(&out), Outcome::Crashed(signal::SIGABRT));
    }

    #[test]
    fn test_qemu_target_signal() {
        let analyzer = OutputAnalyzer::new();
        let out = output(
            Termination::Exited(0),
            "",
            "qemu: uncaught target signal 7 (Bus error) - core dumped\n",
        );
        assert_eq!(analyzer.classify(&out), Outcome::Crashed(7));
    }

    #[test]
    fn test_android_fatal_signal() {
        let analyzer = OutputAnalyzer::new();
        let out = output(
            Termination::Exited(1),
            "",
            "libc: Fatal signal 11 (SIGSEGV), code 1 (SEGV_MAPERR), fault addr 0x0\n",
        );
        assert_eq!(analyzer.classify(&out), Outcome::Crashed(11));
    }

    #[test]
    fn test_word_in_output_is_not_a_crash() {
        let analyzer = OutputAnalyzer::new();
        let out = output(
            Termination::Exited(0),
            "checking that Aborted transactions roll back... ok\n",
            "",
        );
        assert_eq!(analyzer.classify(&out), Outcome::Passed);
    }

    #[test]
    fn test_shell_exit_codes_decoded() {
        let analyzer = OutputAnalyzer::new().with_shell_exit_codes(true);
        let out = output(Termination::Exited(139), "", "");
        assert_eq!(analyzer.classify(&out), Outcome::Crashed(signal::SIGSEGV));

        // SIGTERM (15) is not a crash.
        let term = output(Termination::Exited(143), "", "");
        assert_eq!(
            analyzer.classify(&term),
            Outcome::Failed("terminated by signal 15".to_string())
        );

        // Without decoding, 139 is an ordinary failure.
        let plain = OutputAnalyzer::new();
        assert!(matches!(plain.classify(&out), Outcome::Failed(_)));
    }

    #[test]
    fn test_timeout_and_unknown() {
        let analyzer = OutputAnalyzer::new();
        assert_eq!(
            analyzer.classify(&output(Termination::TimedOut, "", "")),
            Outcome::TimedOut
        );
        assert!(matches!(
            analyzer.classify(&output(Termination::Unknown, "", "")),
            Outcome::Failed(_)
        ));
        assert!(matches!(
            analyzer.classify(&output(Termination::Cancelled, "", "")),
            Outcome::ToolError(_)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_local_signals() {
        let analyzer = OutputAnalyzer::new();
        assert_eq!(
            analyzer.classify(&output(Termination::Signaled(libc::SIGSEGV), "", "")),
            Outcome::Crashed(libc::SIGSEGV)
        );
        assert!(matches!(
            analyzer.classify(&output(Termination::Signaled(libc::SIGTERM), "", "")),
            Outcome::Failed(_)
        ));
    }

    #[test]
    fn test_custom_signature() {
        let analyzer = OutputAnalyzer::new().with_signature(
            CrashSignature::new("go-panic", r"(?m)^panic: ", signal::SIGABRT).unwrap(),
        );
        let out = output(Termination::Exited(0), "panic: runtime error\n", "");
        assert_eq!(analyzer.classify(&out), Outcome::Crashed(signal::SIGABRT));
    }
}
