//! Result aggregation and reporting.
//!
//! [`ResultAggregator`] is the single point where workers publish finished
//! runs. It is created per invocation and summarized once at the end.
//! [`Reporter`]s observe the same results as they arrive.

pub mod junit;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;

use crate::analysis::{Outcome, OutcomeKind};
use crate::orchestrator::TestResult;

pub use junit::{FailureKind, JUnitReporter, JUnitWriter, OutcomeMapping};

/// Process exit codes.
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every test passed |
/// | 1 | At least one test did not pass |
/// | 2 | Setup error (configuration, tools, device, suite) |
/// | 4 | No tests selected |
/// | 130 | Interrupted |
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const FAILED: i32 = 1;
    pub const SETUP_ERROR: i32 = 2;
    pub const NO_TESTS: i32 = 4;
    pub const INTERRUPTED: i32 = 130;
}

/// Suite-level summary.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub total: usize,
    counts: BTreeMap<OutcomeKind, usize>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub interrupted: bool,
}

impl Summary {
    /// Number of runs with the given outcome.
    pub fn count(&self, kind: OutcomeKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    /// Whether every run passed. An empty run is not a success.
    pub fn success(&self) -> bool {
        !self.interrupted && self.total > 0 && self.count(OutcomeKind::Passed) == self.total
    }

    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            exit_code::INTERRUPTED
        } else if self.total == 0 {
            exit_code::NO_TESTS
        } else if self.success() {
            exit_code::SUCCESS
        } else {
            exit_code::FAILED
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

/// Append-only, thread-safe collection of finished runs.
#[derive(Debug)]
pub struct ResultAggregator {
    results: Mutex<Vec<TestResult>>,
    interrupted: AtomicBool,
    started: Instant,
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self {
            results: Mutex::new(Vec::new()),
            interrupted: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    /// Appends one finished run.
    pub fn record(&self, result: TestResult) {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result);
    }

    /// Marks the run as interrupted by the operator.
    pub fn mark_interrupted(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// Snapshot of the results in completion order.
    pub fn results(&self) -> Vec<TestResult> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn summarize(&self) -> Summary {
        let results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
        let mut counts = BTreeMap::new();
        for result in results.iter() {
            *counts.entry(result.outcome.kind()).or_insert(0) += 1;
        }
        Summary {
            total: results.len(),
            counts,
            duration: self.started.elapsed(),
            interrupted: self.interrupted.load(Ordering::SeqCst),
        }
    }
}

/// Receives events during a run.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once before any test runs.
    async fn on_run_start(&self, total: usize, profile: &str);

    /// Called as each test finishes, from the worker that ran it.
    async fn on_test_complete(&self, result: &TestResult);

    /// Called once after every test has finished.
    async fn on_run_complete(&self, summary: &Summary, results: &[TestResult]);
}

/// A reporter that does nothing.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_run_start(&self, _total: usize, _profile: &str) {}
    async fn on_test_complete(&self, _result: &TestResult) {}
    async fn on_run_complete(&self, _summary: &Summary, _results: &[TestResult]) {}
}

/// Fans events out to several reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_run_start(&self, total: usize, profile: &str) {
        for reporter in &self.reporters {
            reporter.on_run_start(total, profile).await;
        }
    }

    async fn on_test_complete(&self, result: &TestResult) {
        for reporter in &self.reporters {
            reporter.on_test_complete(result).await;
        }
    }

    async fn on_run_complete(&self, summary: &Summary, results: &[TestResult]) {
        for reporter in &self.reporters {
            reporter.on_run_complete(summary, results).await;
        }
    }
}

/// Number of trailing output lines shown for each failed test.
const FAILURE_TAIL_LINES: usize = 40;

/// Progress bar while running, counts and failure details at the end.
pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn status(outcome: &Outcome) -> console::StyledObject<&'static str> {
        match outcome {
            Outcome::Passed => console::style("PASS ").green(),
            Outcome::Failed(_) => console::style("FAIL ").red(),
            Outcome::TimedOut => console::style("TIME ").yellow(),
            Outcome::Crashed(_) => console::style("CRASH").red().bold(),
            Outcome::ToolError(_) => console::style("ERROR").magenta(),
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_run_start(&self, total: usize, profile: &str) {
        println!("Running {} tests on {}", total, profile);

        let pb = indicatif::ProgressBar::new(total as u64);
        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = Some(pb);
    }

    async fn on_test_complete(&self, result: &TestResult) {
        let line = format!(
            "{} {} [{:.3}s]",
            Self::status(&result.outcome),
            result.test.name,
            result.duration.as_secs_f64()
        );
        let show = self.verbose || !result.outcome.is_success();

        let guard = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(pb) => {
                pb.inc(1);
                if show {
                    pb.println(line);
                }
            }
            None if show => println!("{}", line),
            None => {}
        }
    }

    async fn on_run_complete(&self, summary: &Summary, results: &[TestResult]) {
        if let Some(pb) = self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pb.finish_and_clear();
        }

        let failures: Vec<_> = results.iter().filter(|r| !r.outcome.is_success()).collect();
        if !failures.is_empty() {
            println!();
            println!("Failures:");
            for r in &failures {
                println!("  {} {}", Self::status(&r.outcome), r.test.name);
                if let Some(msg) = r.outcome.message() {
                    for line in msg.lines().take(5) {
                        println!("    {}", console::style(line).dim());
                    }
                }
                if let Some(cmd) = &r.command {
                    println!("    {} {}", console::style("command:").dim(), cmd);
                }
                if self.verbose {
                    print_tail("stdout", &r.stdout);
                    print_tail("stderr", &r.stderr);
                }
            }
        }

        println!();
        println!("Test Results:");
        println!("  Total:      {}", summary.total);
        println!("  Passed:     {}", console::style(summary.count(OutcomeKind::Passed)).green());
        println!("  Failed:     {}", console::style(summary.count(OutcomeKind::Failed)).red());
        println!("  Timed out:  {}", console::style(summary.count(OutcomeKind::TimedOut)).yellow());
        println!("  Crashed:    {}", console::style(summary.count(OutcomeKind::Crashed)).red());
        println!("  Tool error: {}", console::style(summary.count(OutcomeKind::ToolError)).magenta());
        println!("  Duration:   {:.2}s", summary.duration.as_secs_f64());
        println!();

        if summary.interrupted {
            println!("{}", console::style("Interrupted.").yellow().bold());
        } else if summary.total == 0 {
            println!("{}", console::style("No tests selected.").yellow().bold());
        } else if summary.success() {
            println!("{}", console::style("All tests passed!").green().bold());
        } else {
            println!("{}", console::style("Some tests failed.").red().bold());
        }
    }
}

fn print_tail(label: &str, text: &str) {
    if text.trim().is_empty() {
        return;
    }
    println!("    {}", console::style(format!("{label}:")).dim());
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(FAILURE_TAIL_LINES);
    for line in &lines[skip..] {
        println!("      {}", line);
    }
}
