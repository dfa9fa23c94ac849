use crate::build::Interpreter;
use crate::stdio_for;
use anyhow::{Context, Result};
use bench_core::config::DEFAULT_EXEC_TIMEOUT;
use bench_core::{BenchConfig, LogLevel};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How a single interpreter run ended. Callers judge success through a
/// checker, never through this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// No artifact or no input script; nothing was started.
    Skipped,
    /// `None` when the process was ended by a signal.
    Exited(Option<i32>),
    TimedOut,
}

/// Runs built interpreters against one script with a wall-clock bound.
/// Children start from the configured environment, not the host's.
#[derive(Debug, Clone)]
pub struct ExecutionSandbox {
    timeout: Duration,
    log_level: LogLevel,
    env: BTreeMap<String, String>,
}

impl ExecutionSandbox {
    pub fn new(config: &BenchConfig) -> Self {
        Self {
            timeout: config.exec_timeout,
            log_level: config.log_level,
            env: config.env.clone(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn execute(
        &self,
        interpreter: &Interpreter,
        script: &Path,
        cwd: Option<&Path>,
    ) -> Result<ExecutionOutcome> {
        let Some(exe) = interpreter.exe() else {
            info!(
                "{} - not built, skipping {}.",
                interpreter,
                script.display()
            );
            return Ok(ExecutionOutcome::Skipped);
        };
        if !script.is_file() {
            info!(
                "File '{}' does not exist, compilation of the exploit probably failed. Will not run.",
                script.display()
            );
            return Ok(ExecutionOutcome::Skipped);
        }

        let mut cmd = Command::new(exe);
        cmd.env_clear();
        cmd.envs(&self.env);
        match interpreter.runner() {
            Some(runner) => {
                let input = File::open(script)
                    .with_context(|| format!("open {}", script.display()))?;
                cmd.arg(runner);
                cmd.stdin(Stdio::from(input));
                cmd.env("LUA_PATH", interpreter.work_dir().join("?.lua"));
            }
            None => {
                cmd.arg(script);
                cmd.stdin(Stdio::null());
            }
        }
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdout(stdio_for(self.log_level.stdout()));
        cmd.stderr(stdio_for(self.log_level.stderr()));

        debug!("{} {}", exe.display(), script.display());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {}", exe.display()))?;
        let (status, timed_out) = wait_with_timeout(&mut child, self.timeout)?;
        if timed_out {
            info!("{} - Running {} timeouted.", interpreter, script.display());
            return Ok(ExecutionOutcome::TimedOut);
        }
        debug!("{} exited with {}", interpreter, status);
        Ok(ExecutionOutcome::Exited(status.code()))
    }
}

impl Default for ExecutionSandbox {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_EXEC_TIMEOUT,
            log_level: LogLevel::default(),
            env: std::env::vars().collect(),
        }
    }
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<(ExitStatus, bool)> {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        if let Some(status) = child.try_wait().context("try_wait child")? {
            return Ok((status, false));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            let _ = child.kill();
            let status = child.wait().context("wait child after kill")?;
            return Ok((status, true));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}
