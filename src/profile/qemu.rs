//! User-mode emulation under QEMU.
//!
//! The argument vector is
//!
//! ```text
//! QEMU [QEMU ARGS] [LOADER [--library-path DIR:DIR]] EXE [ARGS]
//! ```
//!
//! `--library-path` is an option of the dynamic loader, so it is only passed
//! when a loader is configured. Every path handed to QEMU is absolute because
//! QEMU resolves relative paths against its own working directory.

use std::path::PathBuf;
use std::sync::OnceLock;

use async_trait::async_trait;
use tracing::debug;

use super::{ExecutionProfile, ProfileContext, ProfileError, ProfileResult, absolutize, split_invocation};
use crate::config::ProfileOptions;
use crate::process::Command;
use crate::suite::TestDescription;
use crate::tool::ToolResolver;

#[derive(Debug)]
pub struct QemuProfile {
    options: ProfileOptions,
    /// QEMU binary as configured.
    binary: String,
    leading_args: Vec<String>,
    loader: Option<PathBuf>,
    library_path: Option<String>,
    tools: ToolResolver,
    working_dir: Option<PathBuf>,
    /// Resolved QEMU binary, set by `prepare`.
    resolved: OnceLock<String>,
}

impl QemuProfile {
    pub fn new(ctx: &ProfileContext) -> ProfileResult<Self> {
        let options = ctx.options.clone();
        let spec = options.qemu.as_deref().ok_or_else(|| {
            ProfileError::Configuration("the qemu profile requires --qemu".to_string())
        })?;
        let mut words = split_invocation("--qemu", spec)?;
        let binary = words.remove(0);

        let loader = options.ld_path.as_deref().map(absolutize).transpose()?;
        let library_path = match &loader {
            Some(_) if !options.lib_paths.is_empty() => Some(
                options
                    .lib_paths
                    .iter()
                    .map(|p| absolutize(p).map(|p| p.to_string_lossy().to_string()))
                    .collect::<ProfileResult<Vec<_>>>()?
                    .join(":"),
            ),
            Some(_) => None,
            None => {
                if !options.lib_paths.is_empty() {
                    debug!("Ignoring library paths for qemu: no loader configured");
                }
                None
            }
        };

        Ok(Self {
            options,
            binary,
            leading_args: words,
            loader,
            library_path,
            tools: ctx.tools.clone(),
            working_dir: ctx.working_dir.clone(),
            resolved: OnceLock::new(),
        })
    }

    fn program(&self) -> &str {
        self.resolved.get().map(String::as_str).unwrap_or(&self.binary)
    }
}

#[async_trait]
impl ExecutionProfile for QemuProfile {
    fn name(&self) -> &str {
        "qemu"
    }

    async fn prepare(&self) -> ProfileResult<()> {
        let path = self.tools.locate(&self.binary)?;
        debug!("Using {} at {}", self.binary, path.display());
        let _ = self.resolved.set(path.to_string_lossy().to_string());
        Ok(())
    }

    async fn build_command(&self, test: &TestDescription) -> ProfileResult<Command> {
        let mut cmd = Command::new(self.program()).args(self.leading_args.iter().cloned());

        if let Some(loader) = &self.loader {
            cmd = cmd.arg(loader.to_string_lossy());
            if let Some(library_path) = &self.library_path {
                cmd = cmd.arg("--library-path").arg(library_path.clone());
            }
        }

        let executable = absolutize(&test.executable)?;
        cmd = cmd
            .arg(executable.to_string_lossy())
            .args(test.args.iter().cloned());

        for (key, value) in &self.options.env {
            cmd = cmd.env(key.clone(), value.clone());
        }
        for (key, value) in &test.env {
            cmd = cmd.env(key.clone(), value.clone());
        }
        if let Some(dir) = test.working_dir.as_ref().or(self.working_dir.as_ref()) {
            cmd = cmd.working_dir(dir.clone());
        }

        Ok(cmd)
    }
}
