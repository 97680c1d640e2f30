//! Bounded worker pool driving test runs to completion.
//!
//! A feeder task pushes pending runs into a bounded queue; `jobs` workers
//! pull from it, each executing one run at a time. Every run is received by
//! exactly one worker.
//!
//! Cancelling the pool's token stops the feeder, makes workers finish any
//! queued runs as cancelled without launching them, and kills in-flight
//! processes through the launcher. `schedule` returns only after every
//! worker has exited.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::run::TestRun;
use crate::analysis::Outcome;
use crate::process::{DEFAULT_OUTPUT_CAP, LaunchOptions};
use crate::profile::ExecutionProfile;
use crate::report::{Reporter, ResultAggregator};

/// Pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrent workers (at least 1).
    pub jobs: usize,
    /// Timeout for tests that do not set their own.
    pub timeout: Option<Duration>,
    /// Per-stream capture limit.
    pub output_cap: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            jobs: 1,
            timeout: None,
            output_cap: DEFAULT_OUTPUT_CAP,
        }
    }
}

/// Executes test runs with bounded parallelism.
pub struct WorkerPool {
    config: PoolConfig,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    pub fn jobs(&self) -> usize {
        self.config.jobs.max(1)
    }

    /// Runs every run to a terminal state, recording each result in
    /// `aggregator` and reporting it to `reporter` as it completes.
    ///
    /// Returns `true` if the pool was cancelled.
    pub async fn schedule(
        &self,
        runs: Vec<TestRun>,
        profile: &dyn ExecutionProfile,
        aggregator: &ResultAggregator,
        reporter: &dyn Reporter,
    ) -> bool {
        let jobs = self.jobs().min(runs.len().max(1));
        info!("Running {} tests with {} workers", runs.len(), jobs);

        let (tx, rx) = mpsc::channel::<TestRun>(jobs);
        let rx = Arc::new(Mutex::new(rx));
        let launch_options = LaunchOptions {
            timeout: self.config.timeout,
            output_cap: self.config.output_cap,
            cancel: self.cancel.clone(),
        };

        tokio_scoped::scope(|scope| {
            let cancel = &self.cancel;

            scope.spawn(async move {
                let mut pending = runs.into_iter();
                for run in pending.by_ref() {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            finish_cancelled(run, aggregator, reporter).await;
                            break;
                        }
                        permit = tx.reserve() => match permit {
                            Ok(permit) => permit.send(run),
                            Err(_) => {
                                // All workers are gone.
                                finish_cancelled(run, aggregator, reporter).await;
                                break;
                            }
                        },
                    }
                }
                for run in pending {
                    finish_cancelled(run, aggregator, reporter).await;
                }
                drop(tx);
            });

            for worker in 0..jobs {
                let rx = Arc::clone(&rx);
                let launch_options = &launch_options;

                scope.spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(mut run) = next else {
                            break;
                        };
                        if cancel.is_cancelled() {
                            finish_cancelled(run, aggregator, reporter).await;
                            continue;
                        }

                        debug!(worker, test = %run.test().name, "Picked up test");
                        if let Err(e) = run.execute(profile, launch_options).await {
                            warn!(worker, "{}", e);
                        }
                        complete(run, aggregator, reporter).await;
                    }
                    debug!(worker, "Worker finished");
                });
            }
        });

        let interrupted = self.cancel.is_cancelled();
        if interrupted {
            aggregator.mark_interrupted();
        }
        interrupted
    }
}

async fn finish_cancelled(mut run: TestRun, aggregator: &ResultAggregator, reporter: &dyn Reporter) {
    if let Err(e) = run.cancel() {
        warn!("{}", e);
    }
    complete(run, aggregator, reporter).await;
}

async fn complete(run: TestRun, aggregator: &ResultAggregator, reporter: &dyn Reporter) {
    let name = run.test().name.clone();
    let result = match run.into_result() {
        Some(result) => result,
        None => {
            warn!(test = %name, "Run ended without an outcome");
            return;
        }
    };
    if let Outcome::ToolError(msg) = &result.outcome {
        debug!(test = %name, "Tool error: {}", msg);
    }
    reporter.on_test_complete(&result).await;
    aggregator.record(result);
}
