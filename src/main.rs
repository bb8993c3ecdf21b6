// src/main.rs

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use packman::journal::RecoveryOutcome;
use packman::{Config, Error, InstallOptions, Packman};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "packman")]
#[command(author, version, about = "Transactional mod manager for games", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(
        short,
        long,
        global = true,
        env = "PACKMAN_CONFIG_FILE",
        default_value = "packman.toml"
    )]
    config: PathBuf,

    /// Install root, overriding the configured one
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install packages, optionally pinned as name@version
    Install {
        #[arg(required = true)]
        packages: Vec<String>,
        /// Reinstall even if the same version is installed
        #[arg(short, long)]
        force: bool,
        /// Ignore cached downloads
        #[arg(long)]
        no_cache: bool,
    },
    /// Uninstall packages (all installed packages if none are named)
    Uninstall { packages: Vec<String> },
    /// List installed packages
    List,
    /// List available package definitions
    Packages,
    /// List versions the sources of a package offer
    Versions { package: String },
    /// Check installed files against their recorded fingerprints
    Validate { packages: Vec<String> },
    /// List modified files left behind by uninstalls
    Orphans,
    /// Show operation history
    History,
    /// Roll back or finish interrupted transactions
    Recover,
    /// Delete an unrecoverable transaction journal without replaying it
    Discard {
        /// Transaction id (tx-...)
        id: String,
    },
    /// Update package definitions from the remote repository
    Update,
    /// Export installed packages as JSON
    Export {
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Install packages from an export
    Import {
        /// Input file (stdin if omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(long)]
        no_cache: bool,
    },
    /// Generate shell completions
    Completions { shell: Shell },
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.as_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Split `name@version`
fn parse_spec(spec: &str) -> (&str, Option<&str>) {
    match spec.split_once('@') {
        Some((name, version)) if !version.is_empty() => (name, Some(version)),
        Some((name, _)) => (name, None),
        None => (spec, None),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "packman", &mut std::io::stdout());
        return Ok(());
    }

    let mut config = Config::load_or_default(&cli.config)?;
    if let Some(root) = cli.root {
        config.root_path = root;
    }
    init_logging(&config);

    let packman = Packman::new(config)?;

    let cancel = packman.cancel_token();
    ctrlc::set_handler(move || {
        eprintln!("Cancelling; rolling back the current transaction");
        cancel.cancel();
    })
    .context("Failed to install Ctrl-C handler")?;

    match cli.command {
        Commands::Install {
            packages,
            force,
            no_cache,
        } => {
            let options = InstallOptions { force, no_cache };
            let mut failed = 0;
            for spec in &packages {
                let (name, version) = parse_spec(spec);
                match packman.install(name, version, options) {
                    Ok(entry) => println!(
                        "Installed {} {} ({} files)",
                        entry.name,
                        entry.version_label(),
                        entry.files.len()
                    ),
                    Err(Error::AlreadyInstalled { name, version }) => {
                        println!("{} {} is already installed", name, version);
                    }
                    Err(e) => {
                        error!("{}: {}", name, e);
                        failed += 1;
                        if matches!(e, Error::Cancelled) {
                            break;
                        }
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{} of {} installs failed", failed, packages.len());
            }
            Ok(())
        }
        Commands::Uninstall { packages } => {
            let names = if packages.is_empty() {
                packman
                    .list_installed()?
                    .into_iter()
                    .map(|entry| entry.name)
                    .collect()
            } else {
                packages
            };

            for name in &names {
                let report = packman.uninstall(name)?;
                println!(
                    "Uninstalled {} ({} deleted, {} restored)",
                    report.package,
                    report.deleted.len(),
                    report.restored.len()
                );
                for path in &report.orphaned {
                    println!("  kept modified file {}", path);
                }
            }
            Ok(())
        }
        Commands::List => {
            let installed = packman.list_installed()?;
            if installed.is_empty() {
                println!("No packages installed");
            }
            for entry in installed {
                println!(
                    "{} {} ({} files, from {})",
                    entry.name,
                    entry.version_label(),
                    entry.files.len(),
                    entry.source_used
                );
            }
            Ok(())
        }
        Commands::Packages => {
            for (name, definition) in packman.package_definitions()? {
                match definition.description {
                    Some(description) => println!("{} - {}", name, description),
                    None => println!("{}", name),
                }
            }
            Ok(())
        }
        Commands::Versions { package } => {
            let versions = packman.available_versions(&package)?;
            if versions.is_empty() {
                println!("No versions listed for {}", package);
            }
            for version in versions {
                println!("{}", version);
            }
            Ok(())
        }
        Commands::Validate { packages } => {
            let names = if packages.is_empty() {
                packman
                    .list_installed()?
                    .into_iter()
                    .map(|entry| entry.name)
                    .collect()
            } else {
                packages
            };

            let mut invalid = 0;
            for name in &names {
                let changed = packman.validate(name)?;
                if changed.is_empty() {
                    println!("{}: OK", name);
                } else {
                    invalid += 1;
                    for path in changed {
                        println!("{}: modified {}", name, path);
                    }
                }
            }
            if invalid > 0 {
                anyhow::bail!("{} package(s) failed validation", invalid);
            }
            Ok(())
        }
        Commands::Orphans => {
            for orphan in packman.orphans()? {
                println!(
                    "{} (from {}, orphaned {})",
                    orphan.path, orphan.package, orphan.orphaned_at
                );
            }
            Ok(())
        }
        Commands::History => {
            for entry in packman.history()? {
                println!(
                    "{}  {:<9} {:<12} {} {}",
                    entry.created_at,
                    entry.kind.as_str(),
                    entry.status.as_str(),
                    entry.package,
                    entry.version.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
        Commands::Recover => {
            let outcomes = packman.recover()?;
            if outcomes.is_empty() {
                println!("Nothing to recover");
            }
            for outcome in outcomes {
                match outcome {
                    RecoveryOutcome::RolledBack { id, package } => {
                        println!("Rolled back {} ({})", package, id)
                    }
                    RecoveryOutcome::Committed { id, package } => {
                        println!("Completed {} ({})", package, id)
                    }
                    RecoveryOutcome::InProgress { id, package } => {
                        println!("Skipped {} ({}): still in progress", package, id)
                    }
                }
            }
            Ok(())
        }
        Commands::Discard { id } => {
            packman.discard_transaction(&id)?;
            println!("Discarded {}", id);
            Ok(())
        }
        Commands::Update => {
            if packman.update_definitions()? {
                info!("Definitions updated");
            }
            Ok(())
        }
        Commands::Export { output } => {
            let json = serde_json::to_string_pretty(&packman.export()?)?;
            match output {
                Some(path) => std::fs::write(&path, json)
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => println!("{}", json),
            }
            Ok(())
        }
        Commands::Import { input, no_cache } => {
            let content = match input {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => std::io::read_to_string(std::io::stdin())?,
            };
            let packages: BTreeMap<String, Option<String>> =
                serde_json::from_str(&content).context("Invalid export file")?;

            let report = packman.import(
                &packages,
                InstallOptions {
                    force: false,
                    no_cache,
                },
            )?;
            println!(
                "{} installed, {} already present",
                report.installed.len(),
                report.skipped.len()
            );
            for (name, reason) in &report.failed {
                println!("  {} failed: {}", name, reason);
            }
            if !report.failed.is_empty() {
                anyhow::bail!("{} package(s) failed to import", report.failed.len());
            }
            Ok(())
        }
        Commands::Completions { .. } => Ok(()),
    }
}
