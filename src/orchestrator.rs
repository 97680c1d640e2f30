//! Test execution engine.
//!
//! # Architecture
//!
//! ```text
//!    Suite                Profile                 WorkerPool
//!      │                     │                        │
//!      │ tests()             │                        │
//!      ▼                     │                        │
//!  Arc<TestDescription> ───► create_run() ──► Vec<TestRun>
//!                                                     │
//!                                                     ▼
//!                            ┌──────────── worker (× jobs) ───────────┐
//!                            │ build_command() → launch() → classify()│
//!                            └───────────────────┬────────────────────┘
//!                                                ▼
//!                                            TestResult
//!                                                │
//!                             ResultAggregator ◄─┴─► Reporter
//!                                    │
//!                                    ▼
//!                             Summary / exit code
//! ```
//!
//! # Example
//!
//! ```no_run
//! use targetrun::config::ProfileOptions;
//! use targetrun::orchestrator::{Orchestrator, PoolConfig};
//! use targetrun::profile::{NativeProfile, ProfileContext};
//! use targetrun::report::ConsoleReporter;
//! use targetrun::suite::Suite;
//! use targetrun::tool::ToolResolver;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ctx = ProfileContext::new(ProfileOptions::default(), ToolResolver::new());
//!     let profile = NativeProfile::new(&ctx)?;
//!     let suite = Suite::from_paths(&["out/test_alloc".into(), "out/test_io".into()])?;
//!
//!     let reporter = ConsoleReporter::new(false);
//!     let orchestrator = Orchestrator::new(&profile, &reporter, PoolConfig::default());
//!     let summary = orchestrator.run(&suite, CancellationToken::new()).await?;
//!
//!     std::process::exit(summary.exit_code());
//! }
//! ```

pub mod pool;
pub mod run;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::profile::{ExecutionProfile, ProfileResult};
use crate::report::{Reporter, ResultAggregator, Summary};
use crate::suite::Suite;

pub use pool::{PoolConfig, WorkerPool};
pub use run::{InvalidTransition, RunState, TestResult, TestRun};

/// Ties a profile, a worker pool and a reporter together for one suite.
pub struct Orchestrator<'a> {
    profile: &'a dyn ExecutionProfile,
    reporter: &'a dyn Reporter,
    config: PoolConfig,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        profile: &'a dyn ExecutionProfile,
        reporter: &'a dyn Reporter,
        config: PoolConfig,
    ) -> Self {
        Self {
            profile,
            reporter,
            config,
        }
    }

    /// Prepares the profile, runs every test in `suite` and summarizes.
    ///
    /// # Errors
    ///
    /// Only profile preparation errors (missing tools, unusable device)
    /// are returned. Per-test failures are part of the summary. Cancelling
    /// `cancel` while the profile is preparing yields an interrupted
    /// summary without launching anything.
    pub async fn run(&self, suite: &Suite, cancel: CancellationToken) -> ProfileResult<Summary> {
        let aggregator = ResultAggregator::new();
        self.reporter
            .on_run_start(suite.len(), self.profile.name())
            .await;

        if suite.is_empty() {
            let summary = aggregator.summarize();
            self.reporter
                .on_run_complete(&summary, &aggregator.results())
                .await;
            return Ok(summary);
        }

        // An interrupt during preparation leaves every run to be finished
        // as cancelled by the pool.
        tokio::select! {
            res = self.profile.prepare() => res?,
            () = cancel.cancelled() => info!("Interrupted while preparing {}", self.profile.name()),
        }

        let runs: Vec<TestRun> = suite
            .tests()
            .iter()
            .cloned()
            .map(|test| self.profile.create_run(test))
            .collect();

        let pool = WorkerPool::new(self.config.clone(), cancel);
        let interrupted = pool
            .schedule(runs, self.profile, &aggregator, self.reporter)
            .await;
        if interrupted {
            info!("Run interrupted");
        }

        let summary = aggregator.summarize();
        self.reporter
            .on_run_complete(&summary, &aggregator.results())
            .await;
        Ok(summary)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    use async_trait::async_trait;

    use super::*;
    use crate::analysis::OutcomeKind;
    use crate::process::Command;
    use crate::profile::ProfileError;
    use crate::report::{NullReporter, exit_code};
    use crate::suite::TestDescription;

    struct ScriptProfile {
        device_ok: bool,
        prepared: AtomicBool,
    }

    #[async_trait]
    impl ExecutionProfile for ScriptProfile {
        fn name(&self) -> &str {
            "script"
        }

        async fn prepare(&self) -> ProfileResult<()> {
            self.prepared.store(true, Ordering::SeqCst);
            if self.device_ok {
                Ok(())
            } else {
                Err(ProfileError::Device("no devices attached".to_string()))
            }
        }

        async fn build_command(&self, test: &TestDescription) -> ProfileResult<Command> {
            Ok(Command::new("/bin/sh").arg("-c").arg(test.args[0].clone()))
        }
    }

    struct StalledProfile;

    #[async_trait]
    impl ExecutionProfile for StalledProfile {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn prepare(&self) -> ProfileResult<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }

        async fn build_command(&self, _test: &TestDescription) -> ProfileResult<Command> {
            Err(ProfileError::Configuration("never launched".to_string()))
        }
    }

    fn suite(scripts: &[(&str, &str)]) -> Suite {
        Suite::new(
            scripts
                .iter()
                .map(|(n, s)| TestDescription::new(*n, "/bin/sh").arg(*s))
                .collect(),
        )
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mixed_suite() {
        let profile = ScriptProfile {
            device_ok: true,
            prepared: AtomicBool::new(false),
        };
        let orchestrator = Orchestrator::new(
            &profile,
            &NullReporter,
            PoolConfig {
                jobs: 2,
                ..Default::default()
            },
        );

        let summary = orchestrator
            .run(
                &suite(&[("a", "true"), ("b", "true"), ("c", "exit 2"), ("d", "kill -SEGV $$")]),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.total, 4);
        assert_eq!(summary.count(OutcomeKind::Passed), 2);
        assert_eq!(summary.count(OutcomeKind::Failed), 1);
        assert_eq!(summary.count(OutcomeKind::Crashed), 1);
        assert_eq!(summary.exit_code(), exit_code::FAILED);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_prepare_error_is_fatal() {
        let profile = ScriptProfile {
            device_ok: false,
            prepared: AtomicBool::new(false),
        };
        let orchestrator = Orchestrator::new(&profile, &NullReporter, PoolConfig::default());

        let err = orchestrator
            .run(&suite(&[("a", "true")]), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProfileError::Device(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_suite_skips_prepare() {
        let profile = Arc::new(ScriptProfile {
            device_ok: false,
            prepared: AtomicBool::new(false),
        });
        let orchestrator =
            Orchestrator::new(profile.as_ref(), &NullReporter, PoolConfig::default());

        let summary = orchestrator
            .run(&Suite::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.exit_code(), exit_code::NO_TESTS);
        assert!(!profile.prepared.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_during_prepare() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let summary = Orchestrator::new(&StalledProfile, &NullReporter, PoolConfig::default())
            .run(&suite(&[("a", "true"), ("b", "true")]), cancel)
            .await
            .unwrap();

        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(summary.interrupted);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.count(OutcomeKind::ToolError), 2);
        assert_eq!(summary.exit_code(), exit_code::INTERRUPTED);
    }
}
