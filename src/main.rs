//! targetrun CLI - parallel test runner for native, ADB and QEMU targets.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use targetrun::config::{self, Config};
use targetrun::orchestrator::{Orchestrator, PoolConfig};
use targetrun::profile::{ExecutionProfile, ProfileArgs, ProfileContext};
use targetrun::registry::ProfileRegistry;
use targetrun::report::{ConsoleReporter, JUnitReporter, MultiReporter, exit_code};
use targetrun::suite::Suite;
use targetrun::tool::ToolResolver;

#[derive(Parser)]
#[command(name = "targetrun")]
#[command(about = "Parallel test runner for native, ADB and QEMU targets", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path [default: targetrun.toml if present]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests on a profile
    Run {
        /// Profile name (see `targetrun profiles`)
        profile: String,

        /// Number of tests to run concurrently
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Per-test timeout in seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,

        #[command(flatten)]
        selection: SelectionArgs,

        #[command(flatten)]
        profile_args: ProfileArgs,
    },

    /// Print the command each selected test would run, without running it
    List {
        /// Profile name (see `targetrun profiles`)
        profile: String,

        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,

        #[command(flatten)]
        selection: SelectionArgs,

        #[command(flatten)]
        profile_args: ProfileArgs,
    },

    /// List available profiles
    Profiles {
        /// Directory of profile descriptors
        #[arg(long, value_name = "DIR")]
        extensions_dir: Option<PathBuf>,

        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Validate the configuration file
    Validate,
}

#[derive(Debug, Clone, Args)]
struct SelectionArgs {
    /// Test manifest (TOML)
    #[arg(long, value_name = "FILE")]
    manifest: Option<PathBuf>,

    /// Only run tests whose name contains PATTERN (repeatable)
    #[arg(long = "filter", value_name = "PATTERN")]
    filters: Vec<String>,

    /// Directory of profile descriptors
    #[arg(long, value_name = "DIR")]
    extensions_dir: Option<PathBuf>,

    /// Test executables
    #[arg(value_name = "TESTS")]
    tests: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", console::style("error:").red().bold(), e);
            exit_code::SETUP_ERROR
        }
    };
    std::process::exit(code);
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Run {
            profile,
            jobs,
            timeout,
            junit,
            selection,
            profile_args,
        } => {
            let config = config::load_or_default(config_path)?;
            run_tests(
                config,
                &profile,
                RunOverrides { jobs, timeout, junit },
                selection,
                profile_args,
                cli.verbose,
            )
            .await
        }
        Commands::List {
            profile,
            format,
            selection,
            profile_args,
        } => {
            let config = config::load_or_default(config_path)?;
            list_tests(config, &profile, format, selection, profile_args).await
        }
        Commands::Profiles {
            extensions_dir,
            format,
        } => {
            let config = config::load_or_default(config_path)?;
            list_profiles(&config, extensions_dir.as_deref(), format)
        }
        Commands::Validate => validate_config(config_path),
    }
}

struct RunOverrides {
    jobs: Option<usize>,
    timeout: Option<u64>,
    junit: Option<PathBuf>,
}

/// Profile built from the registry, CLI and configuration.
struct Selected {
    profile: Box<dyn ExecutionProfile>,
    suite: Suite,
}

fn registry(config: &Config, extensions_dir: Option<&Path>) -> Result<ProfileRegistry> {
    let mut registry = ProfileRegistry::with_builtins();
    if let Some(dir) = extensions_dir.or(config.run.extensions_dir.as_deref()) {
        let added = registry
            .scan(dir)
            .with_context(|| format!("Failed to load extensions from {}", dir.display()))?;
        debug!("Registered {} profile descriptors", added);
    }
    Ok(registry)
}

fn select(
    config: &Config,
    profile_name: &str,
    selection: SelectionArgs,
    profile_args: ProfileArgs,
) -> Result<Selected> {
    let options = config
        .profile
        .clone()
        .overlay(profile_args.into_options());

    let emulator = match &options.emulator {
        Some(spec) => shell_words::split(spec)
            .with_context(|| format!("Malformed emulator command: {}", spec))?,
        None => Vec::new(),
    };
    let tools = ToolResolver::new()
        .with_overrides(config.tools.clone())
        .with_emulator(emulator, options.native_policy.unwrap_or_default());
    let ctx = ProfileContext::new(options, tools).with_working_dir(config.run.working_dir.clone());

    let registry = registry(config, selection.extensions_dir.as_deref())?;
    let profile = registry
        .create(profile_name, &ctx)
        .with_context(|| format!("Failed to set up profile '{}'", profile_name))?;

    let mut suite = match &selection.manifest {
        Some(manifest) => Suite::from_manifest(manifest)?,
        None => Suite::default(),
    };
    if !selection.tests.is_empty() {
        suite = suite.extend(Suite::from_paths(&selection.tests)?)?;
    }
    let suite = suite.filter(&selection.filters);

    Ok(Selected { profile, suite })
}

async fn run_tests(
    mut config: Config,
    profile_name: &str,
    overrides: RunOverrides,
    selection: SelectionArgs,
    profile_args: ProfileArgs,
    verbose: bool,
) -> Result<i32> {
    if let Some(jobs) = overrides.jobs {
        config.run.jobs = Some(jobs);
    }
    if let Some(timeout) = overrides.timeout {
        config.run.timeout_secs = timeout;
    }
    config.validate()?;

    let Selected { profile, suite } = select(&config, profile_name, selection, profile_args)?;

    let jobs = config
        .run
        .jobs
        .or_else(|| profile.default_jobs())
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
    info!(
        "Profile {} with {} jobs, {}s timeout",
        profile.name(),
        jobs,
        config.run.timeout_secs
    );

    let junit_path = overrides.junit.or(config.report.junit.clone());
    let mut reporter = MultiReporter::new().with_reporter(ConsoleReporter::new(verbose));
    if let Some(path) = junit_path {
        reporter = reporter.with_reporter(
            JUnitReporter::new(path).with_suite_name(config.report.suite_name.clone()),
        );
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping");
            interrupt.cancel();
        }
    });

    let pool_config = PoolConfig {
        jobs,
        timeout: Some(Duration::from_secs(config.run.timeout_secs)),
        output_cap: config.run.output_cap_bytes,
    };
    let summary = Orchestrator::new(profile.as_ref(), &reporter, pool_config)
        .run(&suite, cancel)
        .await
        .with_context(|| format!("Profile '{}' is not usable", profile_name))?;

    Ok(summary.exit_code())
}

#[derive(Serialize)]
struct ListedTest {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    program: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    args: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    working_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn list_tests(
    config: Config,
    profile_name: &str,
    format: Format,
    selection: SelectionArgs,
    profile_args: ProfileArgs,
) -> Result<i32> {
    let Selected { profile, suite } = select(&config, profile_name, selection, profile_args)?;

    let mut listed = Vec::with_capacity(suite.len());
    for test in suite.tests() {
        let entry = match profile.build_command(test).await {
            Ok(cmd) => ListedTest {
                name: test.name.clone(),
                command: Some(cmd.to_shell_string()),
                program: Some(cmd.program),
                args: cmd.args,
                env: cmd.env.into_iter().collect(),
                working_dir: cmd.working_dir,
                error: None,
            },
            Err(e) => ListedTest {
                name: test.name.clone(),
                program: None,
                args: Vec::new(),
                env: BTreeMap::new(),
                working_dir: None,
                command: None,
                error: Some(e.to_string()),
            },
        };
        listed.push(entry);
    }

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&listed)?),
        Format::Text => {
            println!("{} tests on {}:", listed.len(), profile.name());
            for test in &listed {
                match (&test.command, &test.error) {
                    (Some(cmd), _) => println!("  {}: {}", test.name, cmd),
                    (None, Some(err)) => {
                        println!("  {}: {}", test.name, console::style(err).red())
                    }
                    (None, None) => println!("  {}", test.name),
                }
            }
        }
    }

    if listed.is_empty() {
        return Ok(exit_code::NO_TESTS);
    }
    Ok(exit_code::SUCCESS)
}

fn list_profiles(config: &Config, extensions_dir: Option<&Path>, format: Format) -> Result<i32> {
    let profiles = registry(config, extensions_dir)?.list();

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&profiles)?),
        Format::Text => {
            println!("Available profiles:");
            for info in &profiles {
                let description = info.description.as_deref().unwrap_or("");
                match &info.source {
                    Some(path) => println!(
                        "  {:<12} {} {}",
                        info.name,
                        description,
                        console::style(format!("({})", path.display())).dim()
                    ),
                    None => println!("  {:<12} {}", info.name, description),
                }
            }
        }
    }
    Ok(exit_code::SUCCESS)
}

fn validate_config(config_path: Option<&Path>) -> Result<i32> {
    let path = config_path.unwrap_or(Path::new(config::DEFAULT_CONFIG_FILE));
    if !path.is_file() {
        bail!("Configuration file not found: {}", path.display());
    }
    let config = config::load_config(path)?;

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    match config.run.jobs {
        Some(jobs) => println!("  Jobs: {}", jobs),
        None => println!("  Jobs: profile default"),
    }
    println!("  Test timeout: {}s", config.run.timeout_secs);
    println!("  Output cap: {} bytes", config.run.output_cap_bytes);
    if let Some(dir) = &config.run.extensions_dir {
        println!("  Extensions: {}", dir.display());
    }
    for (name, path) in &config.tools {
        println!("  Tool {}: {}", name, path.display());
    }
    if let Some(junit) = &config.report.junit {
        println!("  JUnit: {}", junit.display());
    }
    Ok(exit_code::SUCCESS)
}
