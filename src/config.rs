use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for reposweep
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Directory scanned when no path is given on the command line
    #[serde(default = "default_root")]
    pub root: String,

    /// Repository discovery settings
    #[serde(default)]
    pub scan: ScanConfig,

    /// Synchronization behavior settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Repository discovery configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScanConfig {
    /// Number of concurrent directory listings (0 = one per CPU)
    #[serde(default)]
    pub workers: usize,

    /// Name of the subdirectory that marks a repository root
    #[serde(default = "default_marker")]
    pub marker: String,

    /// Descend into symlinked directories
    #[serde(default)]
    pub follow_symlinks: bool,

    /// Directory name patterns that are never descended
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

/// Synchronization configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// History depth for pulls (None = full history)
    #[serde(default = "default_shallow_depth")]
    pub shallow_depth: Option<u32>,

    /// Timeout for each git command in seconds (0 = no timeout)
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Let git write straight to the terminal instead of capturing output
    #[serde(default = "default_true")]
    pub inherit_output: bool,

    /// Exit non-zero when a repository could not be recovered
    #[serde(default)]
    pub fail_on_unrecovered: bool,

    /// Maximum concurrent first-pass pulls (0 = all at once)
    #[serde(default)]
    pub max_parallel: usize,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact" or "full"

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

// Default value functions
fn default_root() -> String {
    ".".to_string()
}
fn default_marker() -> String {
    ".git".to_string()
}
fn default_true() -> bool {
    true
}
fn default_shallow_depth() -> Option<u32> {
    Some(1)
}
fn default_timeout() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

// Default implementations
impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            marker: default_marker(),
            follow_symlinks: false,
            exclude_patterns: Vec::new(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            shallow_depth: default_shallow_depth(),
            timeout: default_timeout(),
            inherit_output: default_true(),
            fail_on_unrecovered: false,
            max_parallel: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_true(),
        }
    }
}

impl ScanConfig {
    /// Worker count with the CPU-count fallback applied
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }
}

impl SyncConfig {
    /// Per-command timeout, if any
    pub fn command_timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("reposweep").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.root = shellexpand::full(&self.root)
            .context("Failed to expand root path")?
            .into_owned();

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: default_root(),
            scan: ScanConfig::default(),
            sync: SyncConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
