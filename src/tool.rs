//! Resolution of external helper tools (adb, qemu, file).
//!
//! Tools are looked up in this order:
//!
//! 1. A `TOOL_<NAME>` environment variable (name upper-cased, `-` → `_`),
//!    e.g. `TOOL_ADB=/opt/platform-tools/adb`
//! 2. The `[tools]` table of the configuration file
//! 3. A search of `PATH`
//!
//! A resolved tool may be prefixed with an emulator wrapper when the tool
//! binary itself is built for a foreign architecture (see [`crate::arch`]).

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::arch::{NativePolicy, is_native};

/// Result type for tool resolution.
pub type ToolResult<T> = Result<T, ToolError>;

/// Errors raised while resolving a tool.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The tool is not on `PATH` and no override names it.
    #[error("Required tool '{name}' not found (set {env_var} or add it to PATH)")]
    NotFound { name: String, env_var: String },

    /// An override points at a path that does not exist.
    #[error("Tool '{name}' override points to missing file: {path}")]
    MissingOverride { name: String, path: PathBuf },
}

/// A tool ready to be invoked: `command[0]` is the program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTool {
    pub name: String,
    pub path: PathBuf,
    /// Full invocation prefix, including any emulator wrapper.
    pub command: Vec<String>,
}

impl ResolvedTool {
    /// Builds a [`crate::process::Command`] invoking this tool.
    pub fn to_command(&self) -> crate::process::Command {
        let (program, rest) = self
            .command
            .split_first()
            .map(|(p, r)| (p.clone(), r.to_vec()))
            .unwrap_or_else(|| (self.path.to_string_lossy().to_string(), Vec::new()));
        crate::process::Command::new(program).args(rest)
    }
}

/// Environment variable that overrides the path of `name`.
pub fn override_var(name: &str) -> String {
    format!("TOOL_{}", name.to_ascii_uppercase().replace('-', "_"))
}

/// Resolves tool names to executable paths.
#[derive(Debug, Clone, Default)]
pub struct ToolResolver {
    overrides: BTreeMap<String, PathBuf>,
    search_path: Option<OsString>,
    emulator: Vec<String>,
    policy: NativePolicy,
}

impl ToolResolver {
    /// Creates a resolver that reads `PATH` and `TOOL_*` at resolve time.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds configuration-file overrides.
    pub fn with_overrides(mut self, overrides: BTreeMap<String, PathBuf>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Uses an explicit search path instead of `PATH`.
    pub fn with_search_path(mut self, path: impl Into<OsString>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    /// Sets the emulator wrapper and the policy deciding when it applies.
    pub fn with_emulator(mut self, emulator: Vec<String>, policy: NativePolicy) -> Self {
        self.emulator = emulator;
        self.policy = policy;
        self
    }

    /// Resolves `name` to a path, without emulator wrapping.
    pub fn locate(&self, name: &str) -> ToolResult<PathBuf> {
        let env_var = override_var(name);

        if let Some(value) = std::env::var_os(&env_var).filter(|v| !v.is_empty()) {
            let path = PathBuf::from(value);
            debug!("Tool {} pinned by {} to {}", name, env_var, path.display());
            return check_override(name, path);
        }

        if let Some(path) = self.overrides.get(name) {
            debug!("Tool {} pinned by config to {}", name, path.display());
            return check_override(name, path.clone());
        }

        let search = self
            .search_path
            .clone()
            .or_else(|| std::env::var_os("PATH"))
            .unwrap_or_default();
        for dir in std::env::split_paths(&search) {
            for candidate in candidates(&dir, name) {
                if candidate.is_file() {
                    debug!("Tool {} found at {}", name, candidate.display());
                    return Ok(candidate);
                }
            }
        }

        Err(ToolError::NotFound {
            name: name.to_string(),
            env_var,
        })
    }

    /// Resolves `name` and applies the emulator wrapper when the tool
    /// binary is not native to the host.
    pub async fn resolve(&self, name: &str) -> ToolResult<ResolvedTool> {
        let path = self.locate(name)?;
        let mut command = vec![path.to_string_lossy().to_string()];

        if !self.emulator.is_empty() && !is_native(&path, self.policy, self).await {
            debug!("Tool {} is foreign, wrapping with {:?}", name, self.emulator);
            let mut wrapped = self.emulator.clone();
            wrapped.append(&mut command);
            command = wrapped;
        }

        Ok(ResolvedTool {
            name: name.to_string(),
            path,
            command,
        })
    }
}

fn check_override(name: &str, path: PathBuf) -> ToolResult<PathBuf> {
    // Bare names are left for the OS to resolve at spawn time.
    if path.components().count() == 1 || path.exists() {
        Ok(path)
    } else {
        Err(ToolError::MissingOverride {
            name: name.to_string(),
            path,
        })
    }
}

fn candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
    if cfg!(windows) && Path::new(name).extension().is_none() {
        vec![dir.join(format!("{name}.exe")), dir.join(name)]
    } else {
        vec![dir.join(name)]
    }
}
