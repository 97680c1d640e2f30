//! The life of one test execution.
//!
//! ```text
//! Pending ──► Launching ──► Running ──► Analyzing ──► Finished(Outcome)
//!    │            │            │
//!    │            └── command  └── spawn failure ──► Finished(ToolError)
//!    │                error ─────────────────────► Finished(ToolError)
//!    └── cancelled before dispatch ──────────────► Finished(ToolError)
//! ```
//!
//! States only move forward and `Finished` is final: the outcome of a run is
//! assigned exactly once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::analysis::Outcome;
use crate::process::{Command, LaunchOptions, ProcessOutput, launch};
use crate::profile::ExecutionProfile;
use crate::suite::TestDescription;

/// Stage of a [`TestRun`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Pending,
    /// The profile is composing the command.
    Launching,
    /// The process is running.
    Running,
    /// The process has ended and is being classified.
    Analyzing,
    Finished(Outcome),
}

impl RunState {
    fn rank(&self) -> u8 {
        match self {
            RunState::Pending => 0,
            RunState::Launching => 1,
            RunState::Running => 2,
            RunState::Analyzing => 3,
            RunState::Finished(_) => 4,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, RunState::Finished(_))
    }
}

/// A transition that would move a run backwards or out of `Finished`.
#[derive(Debug, thiserror::Error)]
#[error("invalid test run transition from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: RunState,
    pub to: RunState,
}

/// Final record of one run, handed to the aggregator and reporters.
#[derive(Debug, Clone)]
pub struct TestResult {
    pub test: Arc<TestDescription>,
    pub outcome: Outcome,
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
    /// Whether captured output was cut at the capture limit.
    pub truncated: bool,
    /// The composed command, when the profile produced one.
    pub command: Option<String>,
}

impl TestResult {
    /// A result with no captured output.
    pub fn new(test: Arc<TestDescription>, outcome: Outcome) -> Self {
        Self {
            test,
            outcome,
            duration: Duration::ZERO,
            stdout: String::new(),
            stderr: String::new(),
            truncated: false,
            command: None,
        }
    }
}

/// One execution of one test.
#[derive(Debug)]
pub struct TestRun {
    test: Arc<TestDescription>,
    state: RunState,
    command: Option<Command>,
    output: Option<ProcessOutput>,
    started: Option<Instant>,
    elapsed: Duration,
}

impl TestRun {
    pub fn new(test: Arc<TestDescription>) -> Self {
        Self {
            test,
            state: RunState::Pending,
            command: None,
            output: None,
            started: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn test(&self) -> &Arc<TestDescription> {
        &self.test
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// The outcome, once finished.
    pub fn outcome(&self) -> Option<&Outcome> {
        match &self.state {
            RunState::Finished(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Moves to `next`, which must be a later stage.
    pub fn transition(&mut self, next: RunState) -> Result<(), InvalidTransition> {
        if next.rank() <= self.state.rank() {
            return Err(InvalidTransition {
                from: self.state.clone(),
                to: next,
            });
        }
        debug!(test = %self.test.name, "{:?} -> {:?}", self.state, next);
        let started = *self.started.get_or_insert_with(Instant::now);
        if next.is_finished() {
            self.elapsed = started.elapsed();
        }
        self.state = next;
        Ok(())
    }

    /// Finishes a run that was never dispatched.
    pub fn cancel(&mut self) -> Result<(), InvalidTransition> {
        self.transition(RunState::Finished(Outcome::ToolError(
            "cancelled before start".to_string(),
        )))
    }

    /// Drives a pending run to its outcome.
    ///
    /// `options.timeout` applies unless the test sets its own.
    pub async fn execute(
        &mut self,
        profile: &dyn ExecutionProfile,
        options: &LaunchOptions,
    ) -> Result<&Outcome, InvalidTransition> {
        self.transition(RunState::Launching)?;

        let command = match profile.build_command(&self.test).await {
            Ok(command) => command,
            Err(e) => {
                warn!(test = %self.test.name, "Cannot build command: {}", e);
                self.transition(RunState::Finished(Outcome::ToolError(e.to_string())))?;
                return self.finished_outcome();
            }
        };
        debug!(test = %self.test.name, command = %command.to_shell_string(), "Launching");
        self.command = Some(command.clone());

        let mut options = options.clone();
        if let Some(timeout) = self.test.timeout {
            options.timeout = Some(timeout);
        }

        self.transition(RunState::Running)?;
        let output = match launch(&command, &options).await {
            Ok(output) => output,
            Err(e) => {
                warn!(test = %self.test.name, "Launch failed: {}", e);
                self.transition(RunState::Finished(Outcome::ToolError(e.to_string())))?;
                return self.finished_outcome();
            }
        };

        self.transition(RunState::Analyzing)?;
        let outcome = profile.analyzer().classify(&output);
        if output.truncated {
            debug!(test = %self.test.name, "Output truncated");
        }
        self.output = Some(output);
        self.transition(RunState::Finished(outcome))?;
        self.finished_outcome()
    }

    fn finished_outcome(&self) -> Result<&Outcome, InvalidTransition> {
        self.outcome().ok_or_else(|| InvalidTransition {
            from: self.state.clone(),
            to: self.state.clone(),
        })
    }

    /// Converts a finished run into its result record.
    ///
    /// Returns `None` if the run has not finished.
    pub fn into_result(self) -> Option<TestResult> {
        let RunState::Finished(outcome) = self.state else {
            return None;
        };
        let (stdout, stderr, truncated, duration) = match self.output {
            Some(output) => (output.stdout, output.stderr, output.truncated, output.duration),
            None => (String::new(), String::new(), false, self.elapsed),
        };
        Some(TestResult {
            test: self.test,
            outcome,
            duration,
            stdout,
            stderr,
            truncated,
            command: self.command.map(|c| c.to_shell_string()),
        })
    }
}
