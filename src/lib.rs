//! targetrun: a parallel conformance test runner for native, Android (ADB)
//! and emulated (QEMU) targets.
//!
//! Test binaries are built elsewhere; targetrun launches each one on the
//! selected target, classifies how it ended, and aggregates the results.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Suite**: immutable test descriptions loaded from paths or a manifest
//! - **Profile**: composes the command for one target kind (native, adb, qemu)
//! - **Process**: launches commands with capped capture, timeouts and cancellation
//! - **Orchestrator**: the per-test state machine and the bounded worker pool
//! - **Report**: result aggregation, exit codes, console and JUnit output
//! - **Registry**: built-in and descriptor-defined profiles by name
//!
//! # Example
//!
//! ```no_run
//! use targetrun::config::ProfileOptions;
//! use targetrun::orchestrator::{Orchestrator, PoolConfig};
//! use targetrun::profile::ProfileContext;
//! use targetrun::registry::ProfileRegistry;
//! use targetrun::report::NullReporter;
//! use targetrun::suite::Suite;
//! use targetrun::tool::ToolResolver;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let options = ProfileOptions {
//!         qemu: Some("qemu-aarch64 -cpu max".into()),
//!         ..Default::default()
//!     };
//!     let ctx = ProfileContext::new(options, ToolResolver::new());
//!     let profile = ProfileRegistry::with_builtins().create("qemu", &ctx)?;
//!
//!     let suite = Suite::from_manifest("suite.toml".as_ref())?;
//!     let summary = Orchestrator::new(profile.as_ref(), &NullReporter, PoolConfig::default())
//!         .run(&suite, CancellationToken::new())
//!         .await?;
//!     std::process::exit(summary.exit_code());
//! }
//! ```

pub mod analysis;
pub mod arch;
pub mod config;
pub mod orchestrator;
pub mod process;
pub mod profile;
pub mod registry;
pub mod report;
pub mod suite;
pub mod tool;

// Re-export commonly used types
pub use analysis::{Outcome, OutcomeKind};
pub use config::{Config, load_config};
pub use orchestrator::{Orchestrator, TestRun};
pub use profile::{ExecutionProfile, ProfileError};
pub use registry::ProfileRegistry;
pub use report::{Reporter, ResultAggregator, Summary};
pub use suite::{Suite, TestDescription};
