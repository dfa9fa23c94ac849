use std::path::PathBuf;
use thiserror::Error;

/// Configuration and build failures that callers need to tell apart.
///
/// Everything else travels as a plain `anyhow::Error`; these variants are
/// wrapped into it and can be recovered with `downcast_ref` where a caller
/// treats one class differently (sweep mode drops a variant on a build
/// failure but aborts on a configuration error).
#[derive(Debug, Error)]
pub enum BenchError {
    #[error("interpreter '{0}' could not be found")]
    UnknownInterpreter(String),
    #[error("mitigation '{0}' could not be found")]
    UnknownMitigation(String),
    #[error("exploit '{0}' could not be found")]
    UnknownExploit(String),
    #[error("exploit checker '{0}' could not be found")]
    UnknownChecker(String),
    #[error("logging level '{0}' not found")]
    UnknownLogLevel(String),
    #[error("toolchain not found in {} and provisioning did not produce it", .0.display())]
    ToolchainMissing(PathBuf),
    #[error("downloading {0} is not allowed")]
    DownloadDisabled(String),
    #[error("download of {url} failed with HTTP status {status}")]
    DownloadFailed { url: String, status: u16 },
    #[error("pristine source for {release} not found in {}", .searched.display())]
    SourceMissing { release: String, searched: PathBuf },
    #[error("'{tool}' failed with exit code {code}")]
    ToolFailed { tool: String, code: i32 },
    #[error("'{tool}' was terminated by a signal")]
    ToolKilled { tool: String },
    #[error("build of {variant} finished but {} was not produced", .path.display())]
    ArtifactMissing { variant: String, path: PathBuf },
    #[error("mitigation '{mitigation}' not available for '{variant}'")]
    MitigationUnavailable { variant: String, mitigation: String },
}

impl BenchError {
    /// Build failures are scoped to a single variant; everything else is a
    /// configuration problem that invalidates the whole run.
    pub fn is_build_failure(&self) -> bool {
        matches!(
            self,
            BenchError::ToolFailed { .. }
                | BenchError::ToolKilled { .. }
                | BenchError::ArtifactMissing { .. }
        )
    }
}
