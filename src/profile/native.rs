//! Direct execution on the host.

use std::ffi::OsString;

use async_trait::async_trait;
use tracing::debug;

use super::{ExecutionProfile, ProfileContext, ProfileError, ProfileResult, absolutize, split_invocation};
use crate::arch::{NativePolicy, is_native};
use crate::config::ProfileOptions;
use crate::process::Command;
use crate::suite::TestDescription;
use crate::tool::ToolResolver;

/// Variable the dynamic loader reads library directories from.
pub const LIBRARY_PATH_VAR: &str = if cfg!(target_os = "macos") {
    "DYLD_LIBRARY_PATH"
} else if cfg!(windows) {
    "PATH"
} else {
    "LD_LIBRARY_PATH"
};

/// Runs test executables directly.
///
/// Configured library directories are joined into [`LIBRARY_PATH_VAR`] in
/// order. When an emulator is configured, binaries that are not native to
/// the host are run through it.
#[derive(Debug)]
pub struct NativeProfile {
    options: ProfileOptions,
    library_path: Option<String>,
    emulator: Vec<String>,
    policy: NativePolicy,
    tools: ToolResolver,
    working_dir: Option<std::path::PathBuf>,
}

impl NativeProfile {
    pub fn new(ctx: &ProfileContext) -> ProfileResult<Self> {
        let options = ctx.options.clone();
        let library_path = join_library_path(&options.lib_paths)?;
        let emulator = match &options.emulator {
            Some(spec) => split_invocation("--emulator", spec)?,
            None => Vec::new(),
        };
        let policy = options.native_policy.unwrap_or_default();

        Ok(Self {
            options,
            library_path,
            emulator,
            policy,
            tools: ctx.tools.clone(),
            working_dir: ctx.working_dir.clone(),
        })
    }
}

fn join_library_path(dirs: &[std::path::PathBuf]) -> ProfileResult<Option<String>> {
    if dirs.is_empty() {
        return Ok(None);
    }
    let joined: OsString = std::env::join_paths(dirs).map_err(|e| {
        ProfileError::Configuration(format!("invalid library search path: {}", e))
    })?;
    Ok(Some(joined.to_string_lossy().to_string()))
}

#[async_trait]
impl ExecutionProfile for NativeProfile {
    fn name(&self) -> &str {
        "native"
    }

    async fn build_command(&self, test: &TestDescription) -> ProfileResult<Command> {
        let executable = absolutize(&test.executable)?;

        let mut cmd = Command::new(executable.to_string_lossy()).args(test.args.iter().cloned());
        if let Some(library_path) = &self.library_path {
            cmd = cmd.env(LIBRARY_PATH_VAR, library_path.clone());
        }
        for (key, value) in &self.options.env {
            cmd = cmd.env(key.clone(), value.clone());
        }
        for (key, value) in &test.env {
            cmd = cmd.env(key.clone(), value.clone());
        }
        if let Some(dir) = test.working_dir.as_ref().or(self.working_dir.as_ref()) {
            cmd = cmd.working_dir(dir.clone());
        }

        if !self.emulator.is_empty() && !is_native(&executable, self.policy, &self.tools).await {
            debug!(test = %test.name, "Running foreign binary under {:?}", self.emulator);
            cmd = cmd.wrapped(&self.emulator);
        }

        Ok(cmd)
    }
}
