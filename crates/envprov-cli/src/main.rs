//! envprov - conda environment provisioning for CI jobs
//!
//! ## Commands
//!
//! - `run`: provision one environment and run the test command in it
//! - `matrix`: run every build-matrix job in its own prefix
//! - `plan`: print the steps a run would execute, without executing them
//! - `select-installer`: show which bootstrap installer a version maps to
//! - `info`: print the resolved configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use envprov::{
    select_bootstrap_installer, BuildMatrix, InterpreterVersion, MatrixReport, ProvisionConfig,
    ProvisionReport, Provisioner, StepStatus, SystemRunner, DEFAULT_CONFIG_FILE,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

/// Fallback variable consulted when neither `--python` nor `ENVPROV_PYTHON_VERSION` is set.
const TRAVIS_PYTHON_VERSION: &str = "TRAVIS_PYTHON_VERSION";

#[derive(Parser)]
#[command(name = "envprov")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Reproducible conda environment provisioning for CI", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Config file (default: ./envprov.toml if present)
    #[arg(short, long, global = true, env = "ENVPROV_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the environment and hand off to the test command
    Run {
        /// Interpreter version (falls back to TRAVIS_PYTHON_VERSION)
        #[arg(short, long, env = "ENVPROV_PYTHON_VERSION")]
        python: Option<String>,

        /// Base installation prefix
        #[arg(long)]
        prefix: Option<PathBuf>,

        /// Write the run report as JSON to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Run build-matrix jobs, each in its own prefix under --root
    Matrix {
        /// Directory holding one subdirectory per job
        #[arg(long, default_value = "envprov-matrix")]
        root: PathBuf,

        /// Only run these jobs (repeatable)
        #[arg(long = "job")]
        jobs: Vec<String>,

        /// Write the matrix report as JSON to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Print the steps a run would execute
    Plan {
        /// Interpreter version (falls back to TRAVIS_PYTHON_VERSION)
        #[arg(short, long, env = "ENVPROV_PYTHON_VERSION")]
        python: Option<String>,

        /// Emit the plan as JSON
        #[arg(long)]
        json_output: bool,
    },

    /// Show the bootstrap installer for an interpreter version
    SelectInstaller {
        /// Interpreter version (falls back to TRAVIS_PYTHON_VERSION)
        #[arg(short, long, env = "ENVPROV_PYTHON_VERSION")]
        python: Option<String>,
    },

    /// Print the resolved configuration as JSON
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    envprov::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;

    let code = match cli.command {
        Commands::Run {
            python,
            prefix,
            report,
        } => cmd_run(config, python, prefix, report.as_deref()).await?,
        Commands::Matrix { root, jobs, report } => {
            cmd_matrix(config, &root, &jobs, report.as_deref()).await?
        }
        Commands::Plan { python, json_output } => cmd_plan(&config, python, json_output)?,
        Commands::SelectInstaller { python } => cmd_select_installer(&config, python)?,
        Commands::Info => cmd_info(&config)?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Defaults, then the config file, then `ENVPROV_*` overrides.
fn load_config(path: Option<&Path>) -> Result<ProvisionConfig> {
    let default_file = Path::new(DEFAULT_CONFIG_FILE);
    let path = match path {
        Some(p) => Some(p),
        None if default_file.exists() => Some(default_file),
        None => None,
    };
    let config = ProvisionConfig::load(path)
        .with_context(|| format!("Failed to load config {:?}", path))?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// `--python` / `ENVPROV_PYTHON_VERSION`, else `TRAVIS_PYTHON_VERSION`.
fn resolve_python(flag: Option<String>) -> Result<InterpreterVersion> {
    let raw = match flag {
        Some(v) => v,
        None => std::env::var(TRAVIS_PYTHON_VERSION).with_context(|| {
            format!(
                "No interpreter version given (use --python or set {})",
                TRAVIS_PYTHON_VERSION
            )
        })?,
    };
    raw.parse()
        .with_context(|| format!("Invalid interpreter version '{}'", raw))
}

async fn cmd_run(
    config: ProvisionConfig,
    python: Option<String>,
    prefix: Option<PathBuf>,
    report_path: Option<&Path>,
) -> Result<i32> {
    let version = resolve_python(python)?;
    let config = match prefix {
        Some(p) => config.with_prefix(p),
        None => config,
    };
    let spec = config
        .environment_spec(version)
        .context("Invalid environment specification")?;

    println!("Provisioning '{}' for python {}", spec.name, version);
    println!("Prefix: {:?}", config.prefix);
    println!();

    let report = Provisioner::run(Arc::new(config), Arc::new(SystemRunner), &spec, None).await;
    print_report(&report);

    if let Some(path) = report_path {
        write_json(path, &report)?;
    }
    Ok(report.exit_code())
}

async fn cmd_matrix(
    config: ProvisionConfig,
    root: &Path,
    jobs: &[String],
    report_path: Option<&Path>,
) -> Result<i32> {
    let matrix = BuildMatrix::from_config(&config)
        .and_then(|m| m.select(jobs))
        .context("Invalid build matrix")?;

    info!(jobs = matrix.jobs().len(), root = ?root, "Running build matrix");
    let report = matrix
        .run(&config, Arc::new(SystemRunner), root)
        .await
        .context("Build matrix failed to run")?;

    print_matrix(&report);
    if let Some(path) = report_path {
        write_json(path, &report)?;
    }
    Ok(report.exit_code())
}

fn cmd_plan(config: &ProvisionConfig, python: Option<String>, json_output: bool) -> Result<i32> {
    let version = resolve_python(python)?;
    let spec = config
        .environment_spec(version)
        .context("Invalid environment specification")?;
    let plan = Provisioner::plan(config, &spec).context("Cannot render plan")?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(0);
    }

    println!("Plan for '{}' (python {}):", spec.name, version);
    for (idx, step) in plan.iter().enumerate() {
        println!("  {:>2}. [{}] {}", idx + 1, step.state, step.step);
        println!("      {}", step.action);
    }
    Ok(0)
}

#[derive(Serialize)]
struct InstallerChoice {
    python: InterpreterVersion,
    installer: &'static str,
    url: String,
    pinned: bool,
}

fn cmd_select_installer(config: &ProvisionConfig, python: Option<String>) -> Result<i32> {
    let version = resolve_python(python)?;
    let installer = select_bootstrap_installer(version, &config.installer);
    let choice = InstallerChoice {
        python: version,
        installer: installer.kind.name(),
        url: installer.url,
        pinned: installer.expected_sha256.is_some(),
    };
    println!("{}", serde_json::to_string_pretty(&choice)?);
    Ok(0)
}

fn cmd_info(config: &ProvisionConfig) -> Result<i32> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(0)
}

fn print_report(report: &ProvisionReport) {
    println!("Run ID: {}", report.run_id);
    if let Some(installer) = &report.installer {
        println!("Installer: {} ({})", installer.kind.name(), installer.url);
    }
    for step in &report.steps {
        let mark = match step.status {
            StepStatus::Passed => "✓",
            StepStatus::Failed => "✗",
            StepStatus::Warned => "!",
        };
        match step.exit_code {
            Some(code) => println!(
                "  {} {} ({}ms, exit code: {})",
                mark, step.step, step.duration_ms, code
            ),
            None => println!("  {} {}", mark, step.step),
        }
    }
    println!();

    if let Some(error) = &report.error {
        println!("✗ Provisioning failed at {} [{}]", error.step, error.class);
        println!("{}", error.message);
    } else if report.success() {
        println!("✓ Environment provisioned and tests passed");
    } else {
        println!(
            "✗ Test command exited with code {}",
            report.test_exit_code.unwrap_or(-1)
        );
    }
}

fn print_matrix(report: &MatrixReport) {
    for job in &report.jobs {
        let status = if job.success() { "✓ PASSED" } else { "✗ FAILED" };
        println!(
            "{:<10} python {:<6} {} (exit code: {})",
            job.job.as_deref().unwrap_or("-"),
            job.interpreter.to_string(),
            status,
            job.exit_code()
        );
        if let Some(error) = &job.error {
            println!("           {} [{}]", error.step, error.class);
        }
    }
    println!();
    let passed = report.jobs.iter().filter(|j| j.success()).count();
    println!("Summary: {}/{} jobs passed", passed, report.jobs.len());
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write report {:?}", path))?;
    info!(path = ?path, "Report written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "envprov", "--verbose", "run", "--python", "2.7", "--report", "out.json",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run { python, report, .. } => {
                assert_eq!(python.as_deref(), Some("2.7"));
                assert_eq!(report, Some(PathBuf::from("out.json")));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_matrix_jobs() {
        let cli =
            Cli::try_parse_from(["envprov", "matrix", "--job", "py27", "--job", "py36"]).unwrap();
        match cli.command {
            Commands::Matrix { jobs, root, .. } => {
                assert_eq!(jobs, vec!["py27", "py36"]);
                assert_eq!(root, PathBuf::from("envprov-matrix"));
            }
            _ => panic!("expected matrix"),
        }
    }

    #[test]
    fn test_resolve_python_flag() {
        let v = resolve_python(Some("3.6".to_string())).unwrap();
        assert_eq!(v, InterpreterVersion::new(3, 6));
        assert!(resolve_python(Some("three".to_string())).is_err());
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("envprov.toml");
        std::fs::write(
            &path,
            r#"
            test_command = ["pytest", "-x"]

            [environment]
            name = "ci"
            base_packages = [{ name = "numpy" }]
            additional = []
            "#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.test_command, vec!["pytest", "-x"]);
        assert_eq!(config.environment.name, "ci");
    }

    #[test]
    fn test_load_config_rejects_interactive_manager() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("envprov.toml");
        std::fs::write(&path, "[manager]\nalways_yes = false\n").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }
}
