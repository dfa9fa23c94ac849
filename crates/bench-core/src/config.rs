use crate::error::BenchError;
use crate::variant::VariantIdentity;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAKE_JOBS: u32 = 8;
pub const TOOLCHAIN_NAME: &str = "w64devkit";

/// Verbosity of both the benchmark's own logs and the child processes it
/// spawns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[default]
    None,
}

/// What happens to one standard stream of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPolicy {
    Inherit,
    Discard,
}

impl LogLevel {
    pub fn parse(value: &str) -> Result<Self, BenchError> {
        match value {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "none" => Ok(LogLevel::None),
            other => Err(BenchError::UnknownLogLevel(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::None => "none",
        }
    }

    /// Default `tracing` filter directive for this level.
    pub fn filter_directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::None => "off",
        }
    }

    pub fn stdout(self) -> StreamPolicy {
        match self {
            LogLevel::Debug => StreamPolicy::Inherit,
            LogLevel::Info | LogLevel::None => StreamPolicy::Discard,
        }
    }

    pub fn stderr(self) -> StreamPolicy {
        match self {
            LogLevel::Debug | LogLevel::Info => StreamPolicy::Inherit,
            LogLevel::None => StreamPolicy::Discard,
        }
    }
}

/// Runtime configuration, built once at startup and read-only afterwards.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Checkout root holding `patches/`, `exploits/` and vendored
    /// `interpreters/`.
    pub code_dir: PathBuf,
    /// Root for everything the benchmark writes.
    pub work_dir: PathBuf,
    /// Provisioned toolchain; tools are looked up in its `bin/`.
    pub toolchain_dir: PathBuf,
    /// Environment handed to toolchain processes.
    pub env: BTreeMap<String, String>,
    pub log_level: LogLevel,
    pub downloads_allowed: bool,
    pub exec_timeout: Duration,
    pub make_jobs: u32,
}

impl BenchConfig {
    pub fn new(code_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        let code_dir = absolutize(&code_dir.into());
        let work_dir = absolutize(&work_dir.into());
        let toolchain_dir = work_dir.join("tools").join(TOOLCHAIN_NAME);
        let mut config = Self {
            code_dir,
            work_dir,
            toolchain_dir,
            env: BTreeMap::new(),
            log_level: LogLevel::default(),
            downloads_allowed: true,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            make_jobs: DEFAULT_MAKE_JOBS,
        };
        config.env = config.toolchain_env(&BTreeMap::new());
        config
    }

    pub fn interpreters_code_dir(&self) -> PathBuf {
        self.code_dir.join("interpreters")
    }

    pub fn interpreters_dir(&self) -> PathBuf {
        self.work_dir.join("interpreters")
    }

    pub fn patches_dir(&self) -> PathBuf {
        self.code_dir.join("patches")
    }

    pub fn exploits_dir(&self) -> PathBuf {
        self.code_dir.join("exploits")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.work_dir.join("temp")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.work_dir.join("tools")
    }

    pub fn toolchain_bin_dir(&self) -> PathBuf {
        self.toolchain_dir.join("bin")
    }

    pub fn exploited_dir(&self) -> PathBuf {
        self.work_dir.join("exploited")
    }

    /// Private working copy for one variant.
    pub fn variant_dir(&self, variant: &VariantIdentity) -> PathBuf {
        self.temp_dir().join(variant.canonical_name())
    }

    /// Pristine sources: vendored copies win over downloaded ones.
    pub fn pristine_source(&self, release: &str) -> PathBuf {
        let vendored = self.interpreters_code_dir().join(release);
        if vendored.exists() {
            vendored
        } else {
            self.interpreters_dir().join(release)
        }
    }

    fn toolchain_env(&self, extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = std::env::vars().collect();
        env.insert(
            "PATH".to_string(),
            self.toolchain_bin_dir().to_string_lossy().to_string(),
        );
        env.insert("MAKEFLAGS".to_string(), format!("-j{}", self.make_jobs));
        env.insert("CC".to_string(), "gcc".to_string());
        env.insert("CXX".to_string(), "g++".to_string());
        for (k, v) in extra {
            env.insert(k.clone(), v.clone());
        }
        env
    }
}

/// On-disk configuration. Every field is optional; command-line flags are
/// merged over it with [`ConfigFile::merge`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub code_dir: Option<PathBuf>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub toolchain_dir: Option<PathBuf>,
    #[serde(default)]
    pub log_level: Option<LogLevel>,
    #[serde(default)]
    pub downloads: Option<bool>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub make_jobs: Option<u32>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let parsed: ConfigFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("parse config {}", path.display()))?;
    Ok(parsed)
}

impl ConfigFile {
    /// Values set in `other` win.
    pub fn merge(mut self, other: ConfigFile) -> ConfigFile {
        self.code_dir = other.code_dir.or(self.code_dir);
        self.work_dir = other.work_dir.or(self.work_dir);
        self.toolchain_dir = other.toolchain_dir.or(self.toolchain_dir);
        self.log_level = other.log_level.or(self.log_level);
        self.downloads = other.downloads.or(self.downloads);
        self.timeout_seconds = other.timeout_seconds.or(self.timeout_seconds);
        self.make_jobs = other.make_jobs.or(self.make_jobs);
        self.env.extend(other.env);
        self
    }

    pub fn into_config(self, default_code_dir: &Path, default_work_dir: &Path) -> BenchConfig {
        let code_dir = self.code_dir.unwrap_or_else(|| default_code_dir.to_path_buf());
        let work_dir = self.work_dir.unwrap_or_else(|| default_work_dir.to_path_buf());
        let mut config = BenchConfig::new(code_dir, work_dir);
        if let Some(dir) = self.toolchain_dir {
            config.toolchain_dir = absolutize(&dir);
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(downloads) = self.downloads {
            config.downloads_allowed = downloads;
        }
        if let Some(secs) = self.timeout_seconds {
            config.exec_timeout = Duration::from_secs(secs);
        }
        if let Some(jobs) = self.make_jobs {
            config.make_jobs = jobs.max(1);
        }
        config.env = config.toolchain_env(&self.env);
        config
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    path.canonicalize().unwrap_or_else(|_| {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    })
}
