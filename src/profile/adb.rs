//! Remote execution on an Android device over ADB.
//!
//! `adb shell` does not forward the local environment, so library paths and
//! environment variables are written into the remote command itself:
//!
//! ```text
//! adb [-s SERIAL] shell "cd BIN && export LD_LIBRARY_PATH='L1:L2' && export K='V' && BIN/EXE ARGS"
//! ```
//!
//! Values are single-quoted and arguments shell-quoted, so test arguments
//! cannot inject remote shell syntax.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{ExecutionProfile, ProfileContext, ProfileError, ProfileResult};
use crate::analysis::OutputAnalyzer;
use crate::config::ProfileOptions;
use crate::process::{Command, always_quote, run_tool, shell_quote};
use crate::suite::TestDescription;
use crate::tool::{ResolvedTool, ToolResolver};

/// Device directory used when no binary path is configured.
pub const DEFAULT_BINARY_PATH: &str = "/data/local/tmp";

const DEVICES_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs tests through `adb shell`.
#[derive(Debug)]
pub struct AdbProfile {
    options: ProfileOptions,
    binary_path: String,
    tools: ToolResolver,
    adb: OnceLock<ResolvedTool>,
}

impl AdbProfile {
    pub fn new(ctx: &ProfileContext) -> ProfileResult<Self> {
        let options = ctx.options.clone();
        for key in options.env.keys() {
            validate_env_key(key)?;
        }
        let binary_path = options
            .binary_path
            .clone()
            .unwrap_or_else(|| DEFAULT_BINARY_PATH.to_string());
        let binary_path = binary_path.trim_end_matches('/').to_string();
        if binary_path.is_empty() {
            return Err(ProfileError::Configuration(
                "binary path must not be the device root".to_string(),
            ));
        }

        Ok(Self {
            options,
            binary_path,
            tools: ctx.tools.clone(),
            adb: OnceLock::new(),
        })
    }

    /// The shell command executed on the device for `test`.
    pub fn remote_command(&self, test: &TestDescription) -> ProfileResult<String> {
        let bin = shell_quote(&self.binary_path);
        let mut parts = vec![format!("cd {}", bin)];

        if !self.options.lib_paths.is_empty() {
            let joined = self
                .options
                .lib_paths
                .iter()
                .map(|p| p.to_string_lossy())
                .collect::<Vec<_>>()
                .join(":");
            parts.push(format!("export LD_LIBRARY_PATH={}", always_quote(&joined)));
        }

        let env = self
            .options
            .env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .chain(test.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        for (key, value) in env {
            validate_env_key(key)?;
            parts.push(format!("export {}={}", key, always_quote(value)));
        }

        let mut invocation = shell_quote(&format!(
            "{}/{}",
            self.binary_path,
            test.executable_name()
        ));
        for arg in &test.args {
            invocation.push(' ');
            invocation.push_str(&shell_quote(arg));
        }
        parts.push(invocation);

        Ok(parts.join(" && "))
    }

    fn adb_command(&self) -> Command {
        let mut cmd = match self.adb.get() {
            Some(tool) => tool.to_command(),
            None => Command::new("adb"),
        };
        if let Some(serial) = &self.options.device_serial {
            cmd = cmd.arg("-s").arg(serial.clone());
        }
        cmd
    }
}

fn validate_env_key(key: &str) -> ProfileResult<()> {
    let mut chars = key.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ProfileError::Configuration(format!(
            "invalid environment variable name for remote shell: '{}'",
            key
        )))
    }
}

/// One line of `adb devices` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedDevice {
    pub serial: String,
    pub state: String,
}

/// Parses the output of `adb devices`.
pub fn parse_devices(output: &str) -> Vec<AttachedDevice> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            let state = fields.next()?;
            Some(AttachedDevice {
                serial: serial.to_string(),
                state: state.to_string(),
            })
        })
        .collect()
}

/// Picks the device tests will run on.
pub fn select_device(devices: &[AttachedDevice], serial: Option<&str>) -> ProfileResult<String> {
    match serial {
        Some(serial) => {
            let device = devices.iter().find(|d| d.serial == serial).ok_or_else(|| {
                ProfileError::Device(format!("device '{}' is not attached", serial))
            })?;
            if device.state != "device" {
                return Err(ProfileError::Device(format!(
                    "device '{}' is {}",
                    serial, device.state
                )));
            }
            Ok(device.serial.clone())
        }
        None => {
            let online: Vec<_> = devices.iter().filter(|d| d.state == "device").collect();
            match online.as_slice() {
                [] => Err(ProfileError::Device("no devices attached".to_string())),
                [device] => Ok(device.serial.clone()),
                many => Err(ProfileError::Device(format!(
                    "{} devices attached ({}); select one with --device-serial",
                    many.len(),
                    many.iter()
                        .map(|d| d.serial.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))),
            }
        }
    }
}

#[async_trait]
impl ExecutionProfile for AdbProfile {
    fn name(&self) -> &str {
        "adb"
    }

    /// One device cannot usefully run tests concurrently.
    fn default_jobs(&self) -> Option<usize> {
        Some(1)
    }

    async fn prepare(&self) -> ProfileResult<()> {
        let adb = self.tools.resolve("adb").await?;
        debug!("Using adb at {}", adb.path.display());
        let listing = adb.to_command().arg("devices");
        let _ = self.adb.set(adb);

        let output = run_tool(&listing, DEVICES_TIMEOUT)
            .await
            .map_err(|e| ProfileError::Device(format!("adb devices failed: {}", e)))?;
        if !output.success() {
            return Err(ProfileError::Device(format!(
                "adb devices failed: {}",
                output.stderr.trim()
            )));
        }

        let devices = parse_devices(&output.stdout);
        let serial = select_device(&devices, self.options.device_serial.as_deref())?;
        info!("Running tests on device {}", serial);
        Ok(())
    }

    async fn build_command(&self, test: &TestDescription) -> ProfileResult<Command> {
        let remote = self.remote_command(test)?;
        Ok(self.adb_command().arg("shell").arg(remote))
    }

    fn analyzer(&self) -> OutputAnalyzer {
        OutputAnalyzer::new().with_shell_exit_codes(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(options: ProfileOptions) -> AdbProfile {
        AdbProfile::new(&ProfileContext::new(options, ToolResolver::new())).unwrap()
    }

    #[test]
    fn test_remote_command_layout() {
        let p = profile(ProfileOptions {
            binary_path: Some("/data/local/tmp".into()),
            lib_paths: vec!["/vendor/lib".into()],
            env: [("FOO".to_string(), "bar".to_string())].into(),
            ..Default::default()
        });
        let test = TestDescription::new("t1", "out/t1").arg("-x");

        assert_eq!(
            p.remote_command(&test).unwrap(),
            "cd /data/local/tmp && export LD_LIBRARY_PATH='/vendor/lib' && export FOO='bar' && /data/local/tmp/t1 -x"
        );
    }

    #[test]
    fn test_no_library_export_without_lib_paths() {
        let p = profile(ProfileOptions::default());
        let cmd = p.remote_command(&TestDescription::new("t", "t")).unwrap();
        assert_eq!(cmd, "cd /data/local/tmp && /data/local/tmp/t");
    }

    #[test]
    fn test_arguments_are_quoted() {
        let p = profile(ProfileOptions::default());
        let test = TestDescription::new("t", "t").args(["; rm -rf /", "$(id)", "it's"]);

        let cmd = p.remote_command(&test).unwrap();
        assert!(cmd.ends_with(r#"/data/local/tmp/t '; rm -rf /' '$(id)' 'it'\''s'"#));
    }

    #[test]
    fn test_env_values_are_quoted() {
        let p = profile(ProfileOptions::default());
        let test = TestDescription::new("t", "t").env("OPTS", "a b;c");
        let cmd = p.remote_command(&test).unwrap();
        assert!(cmd.contains("export OPTS='a b;c'"));
    }

    #[test]
    fn test_invalid_env_key_rejected() {
        let p = profile(ProfileOptions::default());
        let test = TestDescription::new("t", "t").env("BAD;KEY", "x");
        assert!(matches!(
            p.remote_command(&test),
            Err(ProfileError::Configuration(_))
        ));

        let ctx = ProfileContext::new(
            ProfileOptions {
                env: [("1ABC".to_string(), "x".to_string())].into(),
                ..Default::default()
            },
            ToolResolver::new(),
        );
        assert!(AdbProfile::new(&ctx).is_err());
    }

    #[tokio::test]
    async fn test_serial_goes_before_shell() {
        let p = profile(ProfileOptions {
            device_serial: Some("emulator-5554".into()),
            ..Default::default()
        });
        let cmd = p.build_command(&TestDescription::new("t", "t")).await.unwrap();

        assert_eq!(cmd.program, "adb");
        assert_eq!(&cmd.args[..3], &["-s", "emulator-5554", "shell"]);
        assert_eq!(cmd.args.len(), 4);
        assert!(cmd.env.is_empty());
    }

    #[tokio::test]
    async fn test_no_serial() {
        let p = profile(ProfileOptions::default());
        let cmd = p.build_command(&TestDescription::new("t", "t")).await.unwrap();
        assert_eq!(cmd.args[0], "shell");
    }

    #[test]
    fn test_default_jobs_is_one() {
        assert_eq!(profile(ProfileOptions::default()).default_jobs(), Some(1));
    }

    #[test]
    fn test_parse_devices() {
        let output = "* daemon not running; starting now at tcp:5037\n\
                      * daemon started successfully\n\
                      List of devices attached\n\
                      emulator-5554\tdevice\n\
                      R58M12ABCDE\tunauthorized\n\n";
        let devices = parse_devices(output);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].serial, "emulator-5554");
        assert_eq!(devices[1].state, "unauthorized");
    }

    #[test]
    fn test_select_device() {
        let one = parse_devices("List of devices attached\nA\tdevice\n");
        let two = parse_devices("List of devices attached\nA\tdevice\nB\tdevice\n");
        let none = parse_devices("List of devices attached\n\n");
        let offline = parse_devices("List of devices attached\nA\toffline\n");

        assert_eq!(select_device(&one, None).unwrap(), "A");
        assert_eq!(select_device(&two, Some("B")).unwrap(), "B");
        assert!(matches!(select_device(&none, None), Err(ProfileError::Device(_))));
        assert!(matches!(select_device(&two, None), Err(ProfileError::Device(_))));
        assert!(matches!(select_device(&one, Some("Z")), Err(ProfileError::Device(_))));
        assert!(matches!(select_device(&offline, Some("A")), Err(ProfileError::Device(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_prepare_with_fake_adb() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let adb = dir.path().join("adb");
        std::fs::write(
            &adb,
            "#!/bin/sh\necho 'List of devices attached'\nprintf 'emulator-5554\\tdevice\\n'\n",
        )
        .unwrap();
        std::fs::set_permissions(&adb, std::fs::Permissions::from_mode(0o755)).unwrap();

        let tools = ToolResolver::new().with_search_path(dir.path().as_os_str());
        let p = AdbProfile::new(&ProfileContext::new(ProfileOptions::default(), tools)).unwrap();
        p.prepare().await.unwrap();

        let cmd = p.build_command(&TestDescription::new("t", "t")).await.unwrap();
        assert_eq!(cmd.program, adb.to_string_lossy());
    }

    #[tokio::test]
    async fn test_prepare_without_adb_is_tool_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let tools = ToolResolver::new().with_search_path(dir.path().as_os_str());
        let p = AdbProfile::new(&ProfileContext::new(ProfileOptions::default(), tools)).unwrap();

        // TOOL_ADB may be set on a developer machine.
        if std::env::var_os("TOOL_ADB").is_none() {
            assert!(matches!(
                p.prepare().await,
                Err(ProfileError::ToolResolution(_))
            ));
        }
    }
}
