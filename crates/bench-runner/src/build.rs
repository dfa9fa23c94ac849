use crate::patches::{PatchPlan, PatchResolver, ResolutionOutcome};
use crate::provision::Provisioner;
use crate::toolchain::{run_tool, Toolchain};
use anyhow::{Context, Result};
use bench_core::{
    copy_dir_filtered, ensure_dir, remove_dir_if_exists, BenchConfig, BenchError, SourceLayout,
    VariantIdentity,
};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Terminal result of building one variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildArtifact {
    Built(PathBuf),
    /// A requested mitigation does not apply; the working copy is gone.
    Failed,
}

impl BuildArtifact {
    pub fn path(&self) -> Option<&Path> {
        match self {
            BuildArtifact::Built(path) => Some(path),
            BuildArtifact::Failed => None,
        }
    }

    pub fn is_built(&self) -> bool {
        matches!(self, BuildArtifact::Built(_))
    }
}

/// A variant together with its working copy and build result.
#[derive(Debug, Clone)]
pub struct Interpreter {
    identity: VariantIdentity,
    work_dir: PathBuf,
    artifact: BuildArtifact,
    runner: Option<PathBuf>,
}

impl Interpreter {
    pub fn new(identity: VariantIdentity, work_dir: PathBuf, artifact: BuildArtifact) -> Self {
        let runner = identity.runtime_wrapper().map(|script| work_dir.join(script));
        Self {
            identity,
            work_dir,
            artifact,
            runner,
        }
    }

    pub fn identity(&self) -> &VariantIdentity {
        &self.identity
    }

    pub fn canonical_name(&self) -> String {
        self.identity.canonical_name()
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn artifact(&self) -> &BuildArtifact {
        &self.artifact
    }

    pub fn exe(&self) -> Option<&Path> {
        self.artifact.path()
    }

    /// Wrapper script the payload is piped through, when the variant carries
    /// the runtime sandbox mitigation.
    pub fn runner(&self) -> Option<&Path> {
        self.runner.as_deref()
    }
}

impl fmt::Display for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.identity, f)
    }
}

/// Turns variant identities into built interpreters under
/// `<work>/temp/<canonical name>/`.
pub struct BuildPipeline {
    config: Arc<BenchConfig>,
    toolchain: Arc<dyn Toolchain>,
    provisioner: Option<Arc<dyn Provisioner>>,
    resolver: PatchResolver,
}

impl BuildPipeline {
    pub fn new(config: Arc<BenchConfig>, toolchain: Arc<dyn Toolchain>) -> Self {
        let resolver = PatchResolver::new(config.patches_dir());
        Self {
            config,
            toolchain,
            provisioner: None,
            resolver,
        }
    }

    /// Fetch missing downloadable sources before copying them.
    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    /// Builds `variant`, reusing an existing artifact unless `clean` is set.
    ///
    /// Returns [`BuildArtifact::Failed`] when a mitigation is inapplicable.
    /// Patch, toolchain and missing-artifact failures are errors; in every
    /// failure case the working directory is removed.
    pub fn build(&self, variant: &VariantIdentity, clean: bool) -> Result<BuildArtifact> {
        let work_dir = self.config.variant_dir(variant);
        let artifact = work_dir.join(variant.family().artifact_rel_path());

        if !clean && artifact.is_file() {
            debug!("{} already compiled, skipping.", variant);
            return Ok(BuildArtifact::Built(artifact));
        }

        // A working copy without an artifact is never trusted.
        remove_dir_if_exists(&work_dir)?;

        let plan = match self.resolver.resolve(variant) {
            ResolutionOutcome::Plan(plan) => plan,
            ResolutionOutcome::Unbuildable { mitigation } => {
                info!("{} - Patch {} not applicable.", variant, mitigation);
                return Ok(BuildArtifact::Failed);
            }
        };

        debug!("building {} in {}", variant, work_dir.display());
        match self.build_working_copy(variant, &plan, &work_dir, &artifact) {
            Ok(()) => Ok(BuildArtifact::Built(artifact)),
            Err(err) => {
                debug!("Deleting {}.", work_dir.display());
                if let Err(cleanup) = remove_dir_if_exists(&work_dir) {
                    warn!("could not remove {}: {:#}", work_dir.display(), cleanup);
                }
                Err(err.context(format!("build {}", variant)))
            }
        }
    }

    /// Builds `variant` and wraps the result.
    pub fn interpreter(&self, variant: &VariantIdentity, clean: bool) -> Result<Interpreter> {
        let artifact = self.build(variant, clean)?;
        Ok(Interpreter::new(
            variant.clone(),
            self.config.variant_dir(variant),
            artifact,
        ))
    }

    /// Same family and version without mitigations; exploits are compiled
    /// against this.
    pub fn unpatched(&self, interpreter: &Interpreter) -> Result<Interpreter> {
        if interpreter.identity().mitigations().is_empty() {
            return Ok(interpreter.clone());
        }
        self.interpreter(&interpreter.identity().unpatched(), false)
    }

    /// `interpreter` with one more mitigation appended, or `None` when that
    /// mitigation does not apply to it.
    pub fn patched(
        &self,
        interpreter: &Interpreter,
        mitigation: &str,
    ) -> Result<Option<Interpreter>> {
        let derived = interpreter.identity().with_mitigation(mitigation);
        let built = self.interpreter(&derived, false)?;
        if built.artifact().is_built() {
            Ok(Some(built))
        } else {
            Ok(None)
        }
    }

    fn build_working_copy(
        &self,
        variant: &VariantIdentity,
        plan: &PatchPlan,
        work_dir: &Path,
        artifact: &Path,
    ) -> Result<()> {
        let family = variant.family();
        let release = variant.release();
        if family.is_downloadable() {
            if let Some(provisioner) = &self.provisioner {
                provisioner.ensure_available(&release)?;
            }
        }
        let source = self.config.pristine_source(&release);
        if !source.is_dir() {
            return Err(BenchError::SourceMissing {
                release,
                searched: self.config.interpreters_dir(),
            }
            .into());
        }

        ensure_dir(work_dir)?;
        match family.source_layout() {
            SourceLayout::SrcAndMakefile => {
                copy_dir_filtered(&source.join("src"), &work_dir.join("src"), &[])?;
                fs::copy(source.join("Makefile"), work_dir.join("Makefile"))
                    .with_context(|| format!("copy Makefile of {}", release))?;
            }
            SourceLayout::WholeTree => {
                copy_dir_filtered(&source, work_dir, &[".git"])?;
            }
        }

        plan.apply(work_dir, self.toolchain.as_ref())?;

        run_tool(
            self.toolchain.as_ref(),
            "make",
            &family.make_args(work_dir),
            None,
        )?;

        let built = work_dir.join(family.built_rel_path());
        if built != artifact && built.is_file() {
            fs::copy(&built, artifact).with_context(|| {
                format!("copy {} to {}", built.display(), artifact.display())
            })?;
        }
        if !artifact.is_file() {
            return Err(BenchError::ArtifactMissing {
                variant: variant.canonical_name(),
                path: artifact.to_path_buf(),
            }
            .into());
        }
        Ok(())
    }
}
