//! Name → constructor table for execution profiles.
//!
//! The built-in profiles are registered up front. Additional, site-specific
//! profiles are TOML descriptor files in an extensions directory:
//!
//! ```toml
//! # extensions/pixel7.toml
//! kind = "adb"
//! description = "Pixel 7 on the lab bench"
//!
//! [options]
//! device_serial = "28031FDH2004LZ"
//! lib_paths = ["/data/local/tmp/lib"]
//! ```
//!
//! Scanning only records file names; a descriptor is read and validated when
//! its profile is selected. Descriptor options sit below the configuration
//! file and the command line.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::ProfileOptions;
use crate::profile::{
    AdbProfile, ExecutionProfile, NativeProfile, ProfileContext, ProfileError, QemuProfile,
};

/// File in the extensions directory that is never treated as a profile.
pub const BOOTSTRAP_FILE: &str = "registry.toml";

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown profile '{name}' (available: {available})")]
    UnknownProfile { name: String, available: String },

    #[error("Failed to scan extensions directory {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read profile descriptor {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse profile descriptor {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Profile descriptor {path} has unknown kind '{kind}'")]
    UnknownKind { path: PathBuf, kind: String },

    #[error(transparent)]
    Profile(#[from] ProfileError),
}

/// Builds a profile from its context.
pub type ProfileConstructor = fn(&ProfileContext) -> Result<Box<dyn ExecutionProfile>, ProfileError>;

#[derive(Debug, Clone)]
enum Entry {
    Builtin {
        constructor: ProfileConstructor,
        description: &'static str,
    },
    Descriptor {
        path: PathBuf,
    },
}

/// A registered profile, for listings.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ProfileInfo {
    pub name: String,
    /// Descriptor path, or `None` for built-ins.
    pub source: Option<PathBuf>,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Descriptor {
    kind: String,
    description: Option<String>,
    #[serde(default)]
    options: ProfileOptions,
}

/// Registered profiles by name.
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    entries: BTreeMap<String, Entry>,
}

impl ProfileRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding `native`, `adb` and `qemu`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("native", "Run tests directly on the host", |ctx| {
            Ok(Box::new(NativeProfile::new(ctx)?))
        });
        registry.register("adb", "Run tests on an Android device via adb shell", |ctx| {
            Ok(Box::new(AdbProfile::new(ctx)?))
        });
        registry.register("qemu", "Run tests under QEMU user-mode emulation", |ctx| {
            Ok(Box::new(QemuProfile::new(ctx)?))
        });
        registry
    }

    /// Registers a constructor, replacing any entry of the same name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        description: &'static str,
        constructor: ProfileConstructor,
    ) {
        self.entries.insert(
            name.into(),
            Entry::Builtin {
                constructor,
                description,
            },
        );
    }

    /// Registers every `*.toml` file in `dir` by its base name.
    ///
    /// Files are not read here. Names that are already registered are
    /// skipped with a warning. Returns the number of descriptors added.
    pub fn scan(&mut self, dir: &Path) -> RegistryResult<usize> {
        let entries = std::fs::read_dir(dir).map_err(|source| RegistryError::Scan {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
            .filter(|path| path.file_name().is_some_and(|name| name != BOOTSTRAP_FILE))
            .collect();
        paths.sort();

        let mut added = 0;
        for path in paths {
            let Some(name) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            if self.entries.contains_key(&name) {
                warn!("Ignoring {}: profile '{}' already registered", path.display(), name);
                continue;
            }
            debug!("Registered profile '{}' from {}", name, path.display());
            self.entries.insert(name, Entry::Descriptor { path });
            added += 1;
        }
        Ok(added)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Describes every registered profile.
    ///
    /// Descriptor descriptions are read on a best-effort basis.
    pub fn list(&self) -> Vec<ProfileInfo> {
        self.entries
            .iter()
            .map(|(name, entry)| match entry {
                Entry::Builtin { description, .. } => ProfileInfo {
                    name: name.clone(),
                    source: None,
                    description: Some(description.to_string()),
                },
                Entry::Descriptor { path } => ProfileInfo {
                    name: name.clone(),
                    source: Some(path.clone()),
                    description: load_descriptor(path).ok().and_then(|d| d.description),
                },
            })
            .collect()
    }

    /// Constructs the profile registered as `name`.
    pub fn create(
        &self,
        name: &str,
        ctx: &ProfileContext,
    ) -> RegistryResult<Box<dyn ExecutionProfile>> {
        match self.entries.get(name) {
            Some(Entry::Builtin { constructor, .. }) => Ok(constructor(ctx)?),
            Some(Entry::Descriptor { path }) => {
                let descriptor = load_descriptor(path)?;
                let Some(Entry::Builtin { constructor, .. }) = self.entries.get(&descriptor.kind)
                else {
                    return Err(RegistryError::UnknownKind {
                        path: path.clone(),
                        kind: descriptor.kind,
                    });
                };

                let mut ctx = ctx.clone();
                ctx.options = descriptor.options.overlay(ctx.options);
                debug!("Profile '{}' is a {} profile", name, descriptor.kind);
                Ok(constructor(&ctx)?)
            }
            None => Err(RegistryError::UnknownProfile {
                name: name.to_string(),
                available: self.names().join(", "),
            }),
        }
    }
}

fn load_descriptor(path: &Path) -> RegistryResult<Descriptor> {
    let content = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| RegistryError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
