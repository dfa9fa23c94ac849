use crate::provision::Provisioner;
use crate::stdio_for;
use anyhow::{Context, Result};
use bench_core::config::TOOLCHAIN_NAME;
use bench_core::{BenchConfig, BenchError};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::debug;

/// External build tools (`make`, `patch`, ...).
pub trait Toolchain: Send + Sync {
    /// Runs `tool` to completion and returns its exit code. There is no
    /// timeout on toolchain calls.
    fn invoke(&self, tool: &str, args: &[String], cwd: Option<&Path>) -> Result<i32>;
}

/// Invokes `tool` and turns a non-zero exit into [`BenchError::ToolFailed`].
pub fn run_tool(
    toolchain: &dyn Toolchain,
    tool: &str,
    args: &[String],
    cwd: Option<&Path>,
) -> Result<()> {
    let code = toolchain.invoke(tool, args, cwd)?;
    if code != 0 {
        return Err(BenchError::ToolFailed {
            tool: tool.to_string(),
            code,
        }
        .into());
    }
    Ok(())
}

/// Toolchain resolved inside the provisioned toolchain directory, never from
/// the host `PATH`.
pub struct LocalToolchain {
    config: Arc<BenchConfig>,
    provisioner: Option<Arc<dyn Provisioner>>,
}

impl LocalToolchain {
    pub fn new(config: Arc<BenchConfig>) -> Self {
        Self {
            config,
            provisioner: None,
        }
    }

    /// Lets the first tool call fetch a missing toolchain.
    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    fn bin_dir(&self) -> Result<PathBuf> {
        let bin = self.config.toolchain_bin_dir();
        if !bin.is_dir() {
            debug!("{} not found", bin.display());
            if let Some(provisioner) = &self.provisioner {
                provisioner.ensure_available(TOOLCHAIN_NAME)?;
            }
            if !bin.is_dir() {
                return Err(BenchError::ToolchainMissing(bin).into());
            }
        }
        Ok(bin)
    }
}

impl Toolchain for LocalToolchain {
    fn invoke(&self, tool: &str, args: &[String], cwd: Option<&Path>) -> Result<i32> {
        let exe = self
            .bin_dir()?
            .join(format!("{}{}", tool, std::env::consts::EXE_SUFFIX));
        debug!("{} {}", exe.display(), args.join(" "));
        let mut cmd = Command::new(&exe);
        cmd.args(args);
        cmd.env_clear();
        cmd.envs(&self.config.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(stdio_for(self.config.log_level.stdout()));
        cmd.stderr(stdio_for(self.config.log_level.stderr()));
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        let status = cmd
            .status()
            .with_context(|| format!("spawn {}", exe.display()))?;
        status.code().ok_or_else(|| {
            BenchError::ToolKilled {
                tool: tool.to_string(),
            }
            .into()
        })
    }
}
