use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

use reposweep::config::LoggingConfig;
use reposweep::manifest::{self, Manifest};
use reposweep::{
    resolve_root, Config, GitClient, Scanner, Shutdown, SyncEngine, SyncError, Tier,
};

/// Exit status after an interrupt (128 + SIGINT)
const EXIT_INTERRUPTED: u8 = 130;
/// Exit status when `fail_on_unrecovered` is set and something stayed broken
const EXIT_UNRECOVERED: u8 = 2;

#[derive(Parser)]
#[command(name = "reposweep")]
#[command(about = "Find every git repository under a directory and sync them all")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory containing git repositories (defaults to `root` in the config)
    #[arg(short, long, global = true)]
    path: Option<String>,

    /// Number of concurrent directory listings while scanning
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the remote URLs of all repositories
    List {
        /// Save the list to this file instead of printing it
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// List repository paths instead of remote URLs
        #[arg(long)]
        paths: bool,
    },

    /// Pull all repositories, recovering failures with rebase and reset
    Sync {
        /// History depth for pulls
        #[arg(long, conflicts_with = "full_history")]
        depth: Option<u32>,

        /// Pull full history instead of a shallow depth
        #[arg(long)]
        full_history: bool,

        /// Timeout per git command in seconds (0 disables)
        #[arg(long)]
        timeout: Option<u64>,

        /// Exit with status 2 if any repository could not be synced
        #[arg(long)]
        strict: bool,
    },

    /// Export repository paths and remote URLs to a JSON file
    Export {
        /// Output file (defaults to export.json)
        #[arg(short, long)]
        file: Option<String>,
    },

    /// Clone all repositories listed in a JSON file
    Import {
        /// Input file (defaults to export.json)
        #[arg(short, long)]
        file: Option<String>,
    },

    /// Write a default configuration file
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let Cli {
        command,
        config,
        path,
        workers,
        verbose,
    } = cli;

    match command {
        Commands::Init { force } => {
            init_logging(verbose, &LoggingConfig::default());
            cmd_init(config, force)
        }
        Commands::List { file, paths } => {
            let (config, raw_root) = setup(config, verbose, path, workers)?;
            cmd_list(&raw_root, &config, file, paths).await
        }
        Commands::Sync {
            depth,
            full_history,
            timeout,
            strict,
        } => {
            let (mut config, raw_root) = setup(config, verbose, path, workers)?;
            if full_history {
                config.sync.shallow_depth = None;
            } else if depth.is_some() {
                config.sync.shallow_depth = depth;
            }
            if let Some(timeout) = timeout {
                config.sync.timeout = timeout;
            }
            config.sync.fail_on_unrecovered |= strict;
            cmd_sync(&raw_root, &config).await
        }
        Commands::Export { file } => {
            let (config, raw_root) = setup(config, verbose, path, workers)?;
            cmd_export(&raw_root, &config, file).await
        }
        Commands::Import { file } => {
            let (config, raw_root) = setup(config, verbose, path, workers)?;
            cmd_import(&raw_root, &config, file).await
        }
    }
}

/// Load configuration, start logging and apply command line overrides
fn setup(
    config_path: Option<PathBuf>,
    verbose: bool,
    path: Option<String>,
    workers: Option<usize>,
) -> Result<(Config, String)> {
    let mut config = load_config(config_path)?;
    init_logging(verbose, &config.logging);
    info!("Starting reposweep v{}", env!("CARGO_PKG_VERSION"));

    if let Some(workers) = workers {
        config.scan.workers = workers;
    }
    let raw_root = path.unwrap_or_else(|| config.root.clone());

    Ok((config, raw_root))
}

/// Initialize logging based on verbosity level and configuration
fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };

    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(logging.color);
    let layer = if logging.format == "full" {
        layer.boxed()
    } else {
        layer.compact().boxed()
    };

    tracing_subscriber::registry().with(layer).with(filter).init();
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Config::load_or_default(),
    }
}

/// Resolve the root and find every repository below it
async fn discover(raw_root: &str, config: &Config) -> Result<(PathBuf, Vec<PathBuf>)> {
    let root = resolve_root(raw_root)?;
    let scanner = Scanner::new(&config.scan)?;

    let report = scanner.scan(&root).await;
    if !report.unreadable.is_empty() {
        info!("{} directories could not be read", report.unreadable.len());
    }

    Ok((root, report.into_roots()))
}

/// Write a default configuration file
fn cmd_init(config_path: Option<PathBuf>, force: bool) -> Result<ExitCode> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_config_path()?,
    };

    if path.exists() && !force {
        bail!(
            "Configuration already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }
    Config::default().save(&path)?;

    println!("✅ Configuration written to {}", path.display());
    Ok(ExitCode::SUCCESS)
}

/// Print or save the remote URLs (or paths) of every repository
async fn cmd_list(
    raw_root: &str,
    config: &Config,
    file: Option<PathBuf>,
    paths: bool,
) -> Result<ExitCode> {
    let (_, repos) = discover(raw_root, config).await?;

    let lines: Vec<String> = if paths {
        repos.iter().map(|r| r.display().to_string()).collect()
    } else {
        let git = GitClient::new(&config.sync);
        manifest::remote_urls(&git, &repos)
            .await
            .into_iter()
            .map(|(_, url)| url)
            .collect()
    };

    match file {
        Some(file) => {
            save_lines(&file, &lines)?;
            info!("Saved git repository list to {}", file.display());
        }
        None => {
            for line in &lines {
                println!("{}", line);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Sync every repository below the root
async fn cmd_sync(raw_root: &str, config: &Config) -> Result<ExitCode> {
    let (root, repos) = discover(raw_root, config).await?;
    println!("🔍 Found {} repositories under {}", repos.len(), root.display());

    let shutdown = Shutdown::new();
    let listener = shutdown.listen_for_signals();

    let engine = SyncEngine::new(&config.sync);
    let summary = match engine.sync_all(repos, &listener).await {
        Ok(summary) => summary,
        Err(SyncError::Interrupted) => {
            eprintln!("Interrupted, outstanding git processes were stopped");
            return Ok(ExitCode::from(EXIT_INTERRUPTED));
        }
        Err(e) => return Err(e.into()),
    };

    println!("\n🎉 Synchronization Complete!");
    println!("   📊 Total repositories: {}", summary.total_repositories);
    println!("   ✅ In sync: {}", summary.recovered());
    for tier in [Tier::Pull, Tier::Rebase, Tier::Reset] {
        let count = summary.recovered_by(tier);
        if count > 0 {
            println!("      via {}: {}", tier, count);
        }
    }
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

    let failing = summary.still_failing();
    if !failing.is_empty() {
        println!("\n🔍 Could not sync {} repositories:", failing.len());
        for (path, error) in &failing {
            println!("   ❌ {}: {}", path.display(), error);
        }
    }

    if config.sync.fail_on_unrecovered && !failing.is_empty() {
        return Ok(ExitCode::from(EXIT_UNRECOVERED));
    }
    Ok(ExitCode::SUCCESS)
}

/// Export `{relative path: remote url}` for every repository
async fn cmd_export(raw_root: &str, config: &Config, file: Option<String>) -> Result<ExitCode> {
    let (root, repos) = discover(raw_root, config).await?;

    let git = GitClient::new(&config.sync);
    let manifest = Manifest::collect(&git, &root, &repos).await;
    manifest.save(&manifest::export_path(file.as_deref()))?;

    println!("📦 Exported {} repositories", manifest.len());
    Ok(ExitCode::SUCCESS)
}

/// Clone every repository listed in a manifest below the root
async fn cmd_import(raw_root: &str, config: &Config, file: Option<String>) -> Result<ExitCode> {
    let root = resolve_root(raw_root)?;
    let manifest = Manifest::load(&manifest::import_path(file.as_deref()))?;
    println!("📥 Importing {} repositories into {}", manifest.len(), root.display());

    let shutdown = Shutdown::new();
    let listener = shutdown.listen_for_signals();

    let git = GitClient::new(&config.sync);
    let summary = match manifest
        .clone_all(&git, &root, &config.scan.marker, &listener)
        .await
    {
        Ok(summary) => summary,
        Err(SyncError::Interrupted) => {
            eprintln!("Interrupted, outstanding clones were stopped");
            return Ok(ExitCode::from(EXIT_INTERRUPTED));
        }
        Err(e) => return Err(e.into()),
    };

    println!("   ✅ Cloned: {}", summary.cloned.len());
    println!("   ⏭️  Already present: {}", summary.skipped.len());
    if !summary.failed.is_empty() {
        println!("   ❌ Failed: {}", summary.failed.len());
        for (key, error) in &summary.failed {
            println!("      {}: {}", key, error);
        }
        if config.sync.fail_on_unrecovered {
            return Ok(ExitCode::from(EXIT_UNRECOVERED));
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Write one entry per line
fn save_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut content = lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    std::fs::write(path, content)
        .with_context(|| format!("Error in writing to file {}", path.display()))
}
