//! Execution profiles: how a test is launched on one kind of target.
//!
//! A profile turns a [`TestDescription`] into a concrete [`Command`] for its
//! target and knows how that target reports abnormal termination. Three
//! profiles are built in:
//!
//! - [`native::NativeProfile`]: direct execution on the host, optionally
//!   wrapped in an emulator for foreign binaries
//! - [`adb::AdbProfile`]: a remote shell command on an Android device
//! - [`qemu::QemuProfile`]: user-mode emulation under QEMU
//!
//! Profiles are built once per invocation from a [`ProfileContext`] and are
//! shared read-only by every test run afterwards.

pub mod adb;
pub mod native;
pub mod qemu;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::analysis::OutputAnalyzer;
use crate::arch::NativePolicy;
use crate::config::ProfileOptions;
use crate::orchestrator::TestRun;
use crate::process::Command;
use crate::suite::TestDescription;
use crate::tool::{ToolError, ToolResolver};

pub use adb::AdbProfile;
pub use native::NativeProfile;
pub use qemu::QemuProfile;

/// Result type for profile operations.
pub type ProfileResult<T> = Result<T, ProfileError>;

/// Errors raised while preparing a profile or composing a command.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    /// Invalid or missing profile options.
    #[error("Invalid profile configuration: {0}")]
    Configuration(String),

    /// A required host tool could not be resolved.
    #[error(transparent)]
    ToolResolution(#[from] ToolError),

    /// The target device is missing, ambiguous or unreachable.
    #[error("Device error: {0}")]
    Device(String),
}

/// Everything a profile constructor needs.
#[derive(Debug, Clone, Default)]
pub struct ProfileContext {
    /// Merged options (CLI over config file over profile defaults).
    pub options: ProfileOptions,
    /// Host tool resolution.
    pub tools: ToolResolver,
    /// Working directory for local test processes without their own.
    pub working_dir: Option<PathBuf>,
}

impl ProfileContext {
    pub fn new(options: ProfileOptions, tools: ToolResolver) -> Self {
        Self {
            options,
            tools,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }
}

/// A strategy for executing tests on one kind of target.
///
/// # Lifecycle
///
/// 1. Constructed from a [`ProfileContext`] (option validation only)
/// 2. [`prepare`](Self::prepare) once, before any test runs: tool and
///    device checks. Errors here abort the whole invocation.
/// 3. [`build_command`](Self::build_command) once per test, possibly from
///    many workers at the same time. Errors here fail only that test.
#[async_trait]
pub trait ExecutionProfile: Send + Sync {
    /// Profile name, for logs.
    fn name(&self) -> &str;

    /// Parallelism to use when neither the CLI nor the config sets one.
    ///
    /// `None` means the number of available CPUs.
    fn default_jobs(&self) -> Option<usize> {
        None
    }

    /// Checks that the target is usable.
    async fn prepare(&self) -> ProfileResult<()> {
        Ok(())
    }

    /// Composes the command that runs `test` on this target.
    ///
    /// The same test and profile always yield the same command.
    async fn build_command(&self, test: &TestDescription) -> ProfileResult<Command>;

    /// Classifier for processes launched by this profile.
    fn analyzer(&self) -> OutputAnalyzer {
        OutputAnalyzer::new()
    }

    /// Creates a pending run of `test`.
    fn create_run(&self, test: Arc<TestDescription>) -> TestRun {
        TestRun::new(test)
    }
}

/// Makes `path` absolute against the current directory.
pub(crate) fn absolutize(path: &Path) -> ProfileResult<PathBuf> {
    std::path::absolute(path).map_err(|e| {
        ProfileError::Configuration(format!("cannot resolve path {}: {}", path.display(), e))
    })
}

/// Profile options accepted on the command line.
///
/// These are flattened into every subcommand that takes a profile and
/// override the `[profile]` section of the configuration file.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ProfileArgs {
    /// ADB device serial
    #[arg(long, short = 's', value_name = "SERIAL")]
    pub device_serial: Option<String>,

    /// Directory on the device holding the test binaries
    #[arg(long, value_name = "DIR")]
    pub binary_path: Option<String>,

    /// QEMU invocation, e.g. "qemu-aarch64 -cpu max"
    #[arg(long, value_name = "CMD")]
    pub qemu: Option<String>,

    /// Dynamic loader passed to QEMU
    #[arg(long = "ld", value_name = "PATH")]
    pub ld_path: Option<PathBuf>,

    /// Library search directory (repeatable, first wins)
    #[arg(long = "lib-path", value_name = "DIR")]
    pub lib_paths: Vec<PathBuf>,

    /// Emulator wrapper for foreign binaries under the native profile
    #[arg(long, value_name = "CMD")]
    pub emulator: Option<String>,

    /// How to decide whether a binary is native
    #[arg(long, value_enum, value_name = "POLICY")]
    pub native_policy: Option<NativePolicy>,

    /// Environment variable for every test (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,
}

impl ProfileArgs {
    /// Converts the flags into options for [`ProfileOptions::overlay`].
    pub fn into_options(self) -> ProfileOptions {
        ProfileOptions {
            device_serial: self.device_serial,
            binary_path: self.binary_path,
            qemu: self.qemu,
            ld_path: self.ld_path,
            lib_paths: self.lib_paths,
            emulator: self.emulator,
            native_policy: self.native_policy,
            env: self.env.into_iter().collect(),
        }
    }
}

/// Parses `KEY=VALUE`.
pub fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

/// Splits an emulator or QEMU invocation string into words.
pub(crate) fn split_invocation(option: &str, spec: &str) -> ProfileResult<Vec<String>> {
    let words = shell_words::split(spec)
        .map_err(|e| ProfileError::Configuration(format!("malformed {option} '{spec}': {e}")))?;
    if words.is_empty() {
        return Err(ProfileError::Configuration(format!("{option} is empty")));
    }
    Ok(words)
}
