//! Test descriptions and suite loading.
//!
//! A [`TestDescription`] is the immutable record of one test binary to run:
//! its executable path, arguments, per-test environment overrides and an
//! optional timeout. Descriptions are created once when the suite is loaded
//! and shared as `Arc<TestDescription>` between the scheduler, the runs and
//! the result aggregator.
//!
//! Suites come from two places:
//!
//! - A list of executable paths given on the command line
//!   ([`Suite::from_paths`])
//! - A TOML manifest of `[[test]]` tables ([`Suite::from_manifest`])
//!
//! # Manifest Format
//!
//! ```toml
//! [[test]]
//! name = "atomics"
//! path = "bin/atomics"
//! args = ["--quick"]
//! timeout_secs = 60
//!
//! [test.env]
//! GOMAXPROCS = "2"
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

/// Result type for suite loading.
pub type SuiteResult<T> = Result<T, SuiteError>;

/// Errors that can occur while loading a suite.
#[derive(Debug, thiserror::Error)]
pub enum SuiteError {
    /// The manifest could not be read.
    #[error("Failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The manifest is not valid TOML or does not match the schema.
    #[error("Failed to parse manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// Two tests share a name, which would make results ambiguous.
    #[error("Duplicate test name: {0}")]
    DuplicateName(String),

    /// A test path has no usable file name.
    #[error("Cannot derive a test name from path: {0}")]
    Unnamed(PathBuf),
}

/// Immutable description of one test binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestDescription {
    /// Unique name of the test within the suite.
    pub name: String,

    /// Path to the test executable.
    pub executable: PathBuf,

    /// Arguments passed to the executable, in order.
    pub args: Vec<String>,

    /// Per-test environment overrides, applied after profile environment.
    pub env: Vec<(String, String)>,

    /// Per-test timeout. Falls back to the run-wide timeout when `None`.
    pub timeout: Option<Duration>,

    /// Working directory override for the test process.
    pub working_dir: Option<PathBuf>,
}

impl TestDescription {
    /// Creates a description for the given executable.
    ///
    /// # Example
    ///
    /// ```
    /// use targetrun::suite::TestDescription;
    ///
    /// let test = TestDescription::new("t1", "/data/tests/t1")
    ///     .arg("-x")
    ///     .env("FOO", "bar");
    /// assert_eq!(test.args, vec!["-x"]);
    /// ```
    pub fn new(name: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout: None,
            working_dir: None,
        }
    }

    /// Adds a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an environment override.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the per-test timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// File name of the executable, used by remote profiles to locate the
    /// staged copy of the binary.
    pub fn executable_name(&self) -> String {
        self.executable
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.executable.to_string_lossy().to_string())
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default, rename = "test")]
    tests: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    name: Option<String>,
    path: PathBuf,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    timeout_secs: Option<u64>,
    working_dir: Option<PathBuf>,
}

/// An ordered collection of test descriptions.
#[derive(Debug, Clone, Default)]
pub struct Suite {
    tests: Vec<Arc<TestDescription>>,
}

impl Suite {
    /// Builds a suite from already-constructed descriptions.
    pub fn new(tests: Vec<TestDescription>) -> SuiteResult<Self> {
        let mut seen = HashSet::new();
        for test in &tests {
            if !seen.insert(test.name.clone()) {
                return Err(SuiteError::DuplicateName(test.name.clone()));
            }
        }
        Ok(Self {
            tests: tests.into_iter().map(Arc::new).collect(),
        })
    }

    /// Creates one test per executable path, named after the file name.
    pub fn from_paths(paths: &[PathBuf]) -> SuiteResult<Self> {
        let tests = paths
            .iter()
            .map(|path| {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .ok_or_else(|| SuiteError::Unnamed(path.clone()))?;
                Ok(TestDescription::new(name, path.clone()))
            })
            .collect::<SuiteResult<Vec<_>>>()?;
        Self::new(tests)
    }

    /// Loads a TOML manifest.
    ///
    /// Relative test paths and working directories are resolved against the
    /// directory containing the manifest.
    pub fn from_manifest(path: &Path) -> SuiteResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| SuiteError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_manifest_str(&content, base).map_err(|e| match e {
            SuiteError::Parse { source, .. } => SuiteError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parses manifest content, resolving relative paths against `base`.
    pub fn from_manifest_str(content: &str, base: &Path) -> SuiteResult<Self> {
        let manifest: Manifest = toml::from_str(content).map_err(|source| SuiteError::Parse {
            path: PathBuf::from("<manifest>"),
            source,
        })?;

        let tests = manifest
            .tests
            .into_iter()
            .map(|entry| {
                let executable = if entry.path.is_absolute() {
                    entry.path.clone()
                } else {
                    base.join(&entry.path)
                };
                let name = match entry.name {
                    Some(name) => name,
                    None => entry
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .ok_or_else(|| SuiteError::Unnamed(entry.path.clone()))?,
                };

                let mut test = TestDescription::new(name, executable).args(entry.args);
                for (key, value) in entry.env {
                    test = test.env(key, value);
                }
                if let Some(secs) = entry.timeout_secs {
                    test = test.timeout(Duration::from_secs(secs));
                }
                if let Some(dir) = entry.working_dir {
                    test = test.working_dir(if dir.is_absolute() { dir } else { base.join(dir) });
                }
                Ok(test)
            })
            .collect::<SuiteResult<Vec<_>>>()?;

        debug!("Loaded {} tests from manifest", tests.len());
        Self::new(tests)
    }

    /// Keeps only tests whose name contains one of `patterns`.
    ///
    /// An empty pattern list keeps every test.
    pub fn filter(self, patterns: &[String]) -> Self {
        if patterns.is_empty() {
            return self;
        }
        Self {
            tests: self
                .tests
                .into_iter()
                .filter(|t| patterns.iter().any(|p| t.name.contains(p.as_str())))
                .collect(),
        }
    }

    /// Appends another suite. Fails on duplicate names.
    pub fn extend(self, other: Suite) -> SuiteResult<Self> {
        let tests = self
            .tests
            .into_iter()
            .chain(other.tests)
            .map(Arc::unwrap_or_clone)
            .collect();
        Self::new(tests)
    }

    /// The tests in load order.
    pub fn tests(&self) -> &[Arc<TestDescription>] {
        &self.tests
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_paths_uses_file_names() {
        let suite = Suite::from_paths(&[
            PathBuf::from("out/bin/alpha"),
            PathBuf::from("out/bin/beta"),
        ])
        .unwrap();

        assert_eq!(suite.len(), 2);
        assert_eq!(suite.tests()[0].name, "alpha");
        assert_eq!(suite.tests()[1].executable, PathBuf::from("out/bin/beta"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = Suite::from_paths(&[PathBuf::from("a/t1"), PathBuf::from("b/t1")]).unwrap_err();
        assert!(matches!(err, SuiteError::DuplicateName(name) if name == "t1"));
    }

    #[test]
    fn test_manifest_resolves_relative_paths() {
        let suite = Suite::from_manifest_str(
            r#"
            [[test]]
            name = "atomics"
            path = "bin/atomics"
            args = ["--quick", "-v"]
            timeout_secs = 5

            [test.env]
            B = "2"
            A = "1"

            [[test]]
            path = "/abs/other"
            "#,
            Path::new("/suite"),
        )
        .unwrap();

        let first = &suite.tests()[0];
        assert_eq!(first.executable, PathBuf::from("/suite/bin/atomics"));
        assert_eq!(first.args, vec!["--quick", "-v"]);
        assert_eq!(first.timeout, Some(Duration::from_secs(5)));
        // TOML tables are sorted by key, keeping composition deterministic
        assert_eq!(
            first.env,
            vec![("A".into(), "1".into()), ("B".into(), "2".into())]
        );

        let second = &suite.tests()[1];
        assert_eq!(second.name, "other");
        assert_eq!(second.executable, PathBuf::from("/abs/other"));
    }

    #[test]
    fn test_manifest_parse_error() {
        let err = Suite::from_manifest_str("[[test]]\nargs = 3", Path::new(".")).unwrap_err();
        assert!(matches!(err, SuiteError::Parse { .. }));
    }

    #[test]
    fn test_filter() {
        let suite = Suite::from_paths(&[
            PathBuf::from("chan_close"),
            PathBuf::from("chan_send"),
            PathBuf::from("map_grow"),
        ])
        .unwrap();

        let filtered = suite.clone().filter(&["chan".to_string()]);
        assert_eq!(filtered.len(), 2);

        let all = suite.filter(&[]);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_executable_name() {
        let test = TestDescription::new("t1", "/host/out/t1");
        assert_eq!(test.executable_name(), "t1");
    }
}
