use crate::exploit::escape_path;
use anyhow::Result;
use bench_core::{ensure_dir, remove_dir_if_exists, BenchConfig, BenchError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const ARBITRARY_WRITE: &str = "arbitrary-write";
pub const CHECKERS: &[&str] = &[ARBITRARY_WRITE];

/// Detects whether an exploit achieved its effect.
pub trait ExploitChecker {
    fn name(&self) -> &str;

    /// Resets detection state before a run.
    fn prepare(&mut self) -> Result<()>;

    fn is_exploited(&self) -> bool;

    /// Values exploit templates may reference, such as the file the payload
    /// should try to write.
    fn template_values(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// Succeeds when the payload managed to create a file the interpreter should
/// never be able to write.
pub struct ArbitraryWriteChecker {
    dir: PathBuf,
    target: PathBuf,
}

impl ArbitraryWriteChecker {
    pub const TARGET_FILE: &'static str = "exploited.txt";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let target = dir.join(Self::TARGET_FILE);
        Self { dir, target }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

impl ExploitChecker for ArbitraryWriteChecker {
    fn name(&self) -> &str {
        ARBITRARY_WRITE
    }

    fn prepare(&mut self) -> Result<()> {
        remove_dir_if_exists(&self.dir)?;
        ensure_dir(&self.dir)?;
        debug!("armed {}", self.target.display());
        Ok(())
    }

    fn is_exploited(&self) -> bool {
        self.target.exists()
    }

    fn template_values(&self) -> BTreeMap<String, String> {
        let mut values = BTreeMap::new();
        values.insert("exploited_file".to_string(), escape_path(&self.target));
        values.insert("exploited_dir".to_string(), escape_path(&self.dir));
        values
    }
}

pub fn create_checker(
    config: &BenchConfig,
    name: &str,
) -> Result<Box<dyn ExploitChecker>, BenchError> {
    match name {
        ARBITRARY_WRITE => Ok(Box::new(ArbitraryWriteChecker::new(config.exploited_dir()))),
        other => Err(BenchError::UnknownChecker(other.to_string())),
    }
}
