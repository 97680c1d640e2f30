//! Native-vs-emulated detection for executables.
//!
//! On non-Windows hosts the architecture of an executable is probed with
//! `file(1)`. The probe output is sanitized (build-id hashes can contain
//! digit runs such as `386`) and then matched against markers for the host
//! machine reported by `uname -m`.
//!
//! This is a heuristic. [`NativePolicy`] lets the operator force either
//! answer.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::process::{Command, run_tool};
use crate::tool::ToolResolver;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Operator override for native detection.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum NativePolicy {
    /// Probe the executable.
    #[default]
    Auto,
    /// Treat every executable as native.
    Native,
    /// Treat every executable as foreign.
    Emulated,
}

fn build_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)BuildID\[[^\]]*\]\s*=\s*[0-9a-f]+|\b[0-9a-f]{16,}\b")
            .expect("static regex is valid")
    })
}

/// Removes build-identifier hashes from `file(1)` output.
pub fn sanitize_probe_output(output: &str) -> String {
    build_id_regex().replace_all(output, "").to_string()
}

/// Markers `file(1)` prints for binaries of the given machine.
///
/// An empty slice means the machine is unknown and cannot be matched.
pub fn host_markers(machine: &str) -> &'static [&'static str] {
    match machine {
        // 64-bit x86 hosts run 32-bit x86 binaries natively.
        "x86_64" | "amd64" => &["x86-64", "x86_64", "80386"],
        "i386" | "i486" | "i586" | "i686" | "x86" => &["80386", "i386"],
        "aarch64" | "arm64" => &["aarch64", "arm64"],
        "riscv64" => &["risc-v"],
        "ppc64le" | "powerpc64le" | "powerpc64" => &["powerpc"],
        "s390x" => &["s/390"],
        m if m.starts_with("arm") => &["arm,", "arm eabi"],
        _ => &[],
    }
}

/// Decides from sanitized probe output whether the binary matches `machine`.
pub fn matches_host(probe_output: &str, machine: &str) -> bool {
    let sanitized = sanitize_probe_output(probe_output).to_ascii_lowercase();

    // Scripts and data files run through the host's own interpreters.
    let is_binary = ["elf", "mach-o", "pe32"]
        .iter()
        .any(|kind| sanitized.contains(kind));
    if !is_binary {
        return true;
    }

    let markers = host_markers(machine);
    if markers.is_empty() {
        return true;
    }
    markers.iter().any(|m| sanitized.contains(m))
}

/// Reports the host machine name, preferring `uname -m`.
///
/// The answer is computed once per process.
pub async fn host_machine() -> &'static str {
    static MACHINE: tokio::sync::OnceCell<String> = tokio::sync::OnceCell::const_new();
    MACHINE.get_or_init(probe_host_machine).await.as_str()
}

async fn probe_host_machine() -> String {
    if cfg!(unix) {
        match run_tool(&Command::new("uname").arg("-m"), PROBE_TIMEOUT).await {
            Ok(out) if out.success() && !out.stdout.trim().is_empty() => {
                return out.stdout.trim().to_string();
            }
            Ok(out) => debug!("uname -m failed: {}", out.stderr.trim()),
            Err(e) => debug!("uname -m failed: {}", e),
        }
    }
    std::env::consts::ARCH.to_string()
}

/// Whether `executable` can run directly on this host.
///
/// On Windows this is always `true`. Probe failures are treated as native
/// with a warning, since wrapping a native binary in an emulator is the
/// worse mistake.
pub async fn is_native(executable: &Path, policy: NativePolicy, tools: &ToolResolver) -> bool {
    match policy {
        NativePolicy::Native => return true,
        NativePolicy::Emulated => return false,
        NativePolicy::Auto => {}
    }
    if cfg!(windows) {
        return true;
    }

    let file_tool = match tools.locate("file") {
        Ok(path) => path,
        Err(e) => {
            warn!("Cannot probe architecture of {}: {}", executable.display(), e);
            return true;
        }
    };

    let probe = Command::new(file_tool.to_string_lossy())
        .arg("-b")
        .arg("-L")
        .arg(executable.to_string_lossy());
    let output = match run_tool(&probe, PROBE_TIMEOUT).await {
        Ok(out) if out.success() => out.stdout,
        Ok(out) => {
            warn!(
                "Architecture probe of {} failed: {}",
                executable.display(),
                out.stderr.trim()
            );
            return true;
        }
        Err(e) => {
            warn!("Architecture probe of {} failed: {}", executable.display(), e);
            return true;
        }
    };

    let machine = host_machine().await;
    let native = matches_host(&output, machine);
    debug!(
        executable = %executable.display(),
        machine,
        native,
        "Probed executable architecture"
    );
    native
}
