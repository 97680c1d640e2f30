//! Configuration schema definitions for targetrun.
//!
//! All types here deserialize from the optional `targetrun.toml` file.
//! Every section has defaults, so an empty file is a valid configuration.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── RunConfig         - Parallelism, timeouts, capture limits
//! ├── ProfileOptions    - Defaults for profile options (serial, qemu, paths)
//! ├── tools             - Tool name → path overrides
//! └── ReportConfig      - JUnit output settings
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::arch::NativePolicy;
use crate::process::DEFAULT_OUTPUT_CAP;

/// Root configuration structure.
///
/// # Example
///
/// ```
/// use targetrun::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [run]
///     jobs = 4
///
///     [profile]
///     qemu = "qemu-aarch64 -cpu max"
///     lib_paths = ["sysroot/lib"]
///
///     [tools]
///     adb = "/opt/platform-tools/adb"
/// "#).unwrap();
///
/// assert_eq!(config.run.jobs, Some(4));
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Run-wide settings.
    #[serde(default)]
    pub run: RunConfig,

    /// Defaults for profile options. CLI flags override these.
    #[serde(default)]
    pub profile: ProfileOptions,

    /// Explicit tool paths, consulted after `TOOL_<NAME>` variables.
    #[serde(default)]
    pub tools: BTreeMap<String, PathBuf>,

    /// Report settings.
    #[serde(default)]
    pub report: ReportConfig,
}

/// Run-wide execution settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `jobs` | profile default, else available CPUs |
/// | `timeout_secs` | 300 |
/// | `output_cap_bytes` | 4 MiB |
/// | `working_dir` | None (current directory) |
/// | `extensions_dir` | None (no extension scan) |
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Number of tests to run concurrently.
    pub jobs: Option<usize>,

    /// Timeout for each test in seconds, unless the test sets its own.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum bytes of stdout and of stderr kept per test.
    #[serde(default = "default_output_cap")]
    pub output_cap_bytes: usize,

    /// Working directory for local test processes.
    pub working_dir: Option<PathBuf>,

    /// Directory scanned for profile extension descriptors.
    pub extensions_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            jobs: None,
            timeout_secs: default_timeout_secs(),
            output_cap_bytes: default_output_cap(),
            working_dir: None,
            extensions_dir: None,
        }
    }
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_output_cap() -> usize {
    DEFAULT_OUTPUT_CAP
}

/// Target-specific options shared by the built-in profiles.
///
/// Each profile reads the fields it understands and ignores the rest:
///
/// | Field | native | adb | qemu |
/// |-------|--------|-----|------|
/// | `device_serial` | | ✓ | |
/// | `binary_path` | | ✓ | |
/// | `qemu` | | | ✓ |
/// | `ld_path` | | | ✓ |
/// | `lib_paths` | ✓ | ✓ | ✓ |
/// | `emulator` | ✓ | | |
/// | `native_policy` | ✓ | | |
/// | `env` | ✓ | ✓ | ✓ |
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileOptions {
    /// ADB device serial (`adb -s`).
    pub device_serial: Option<String>,

    /// Directory on the device holding the test binaries.
    pub binary_path: Option<String>,

    /// QEMU invocation, e.g. `"qemu-aarch64 -cpu max"`.
    pub qemu: Option<String>,

    /// Dynamic loader passed to QEMU.
    pub ld_path: Option<PathBuf>,

    /// Library search directories, in priority order.
    #[serde(default)]
    pub lib_paths: Vec<PathBuf>,

    /// Emulator wrapper for foreign binaries under the native profile.
    pub emulator: Option<String>,

    /// Override for native-vs-emulated detection.
    pub native_policy: Option<NativePolicy>,

    /// Environment variables set for every test.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ProfileOptions {
    /// Returns `self` with every option set in `other` taking precedence.
    ///
    /// Scalars are replaced when set, `lib_paths` is replaced when
    /// non-empty, and `env` entries are merged key by key.
    pub fn overlay(mut self, other: ProfileOptions) -> ProfileOptions {
        if other.device_serial.is_some() {
            self.device_serial = other.device_serial;
        }
        if other.binary_path.is_some() {
            self.binary_path = other.binary_path;
        }
        if other.qemu.is_some() {
            self.qemu = other.qemu;
        }
        if other.ld_path.is_some() {
            self.ld_path = other.ld_path;
        }
        if !other.lib_paths.is_empty() {
            self.lib_paths = other.lib_paths;
        }
        if other.emulator.is_some() {
            self.emulator = other.emulator;
        }
        if other.native_policy.is_some() {
            self.native_policy = other.native_policy;
        }
        self.env.extend(other.env);
        self
    }
}

/// Report configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReportConfig {
    /// Write a JUnit XML report to this path.
    pub junit: Option<PathBuf>,

    /// Test suite name in the JUnit report.
    #[serde(default = "default_suite_name")]
    pub suite_name: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            junit: None,
            suite_name: default_suite_name(),
        }
    }
}

fn default_suite_name() -> String {
    "targetrun".to_string()
}
