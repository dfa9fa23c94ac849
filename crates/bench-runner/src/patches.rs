//! Patch resolution: which diffs and overlays turn a pristine source tree
//! into a given variant.
//!
//! Repository layout, relative to the patches root:
//!
//! ```text
//! <release>.patch                 base patch, version-specific
//! <family>.patch                  base patch, family-generic
//! <mitigation>/<release>.patch    diff, version-specific
//! <mitigation>/<family>.patch     diff, family-generic
//! <mitigation>/<family>/...       overlay, family-generic
//! <mitigation>/<release>/...      overlay, version-specific
//! ```
//!
//! Resolution is a pure lookup. A mitigation with neither a diff nor an
//! overlay makes the whole variant unbuildable before anything is applied.

use crate::toolchain::{run_tool, Toolchain};
use anyhow::Result;
use bench_core::{copy_dir_filtered, VariantIdentity};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchStep {
    /// Unified diff applied with `patch -p1`.
    Diff(PathBuf),
    /// Directory copied verbatim over the working tree.
    Overlay(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MitigationPatches {
    pub mitigation: String,
    pub steps: Vec<PatchStep>,
}

/// Everything needed to turn a pristine working copy into the variant, in
/// application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchPlan {
    pub base: Option<PathBuf>,
    pub mitigations: Vec<MitigationPatches>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    Plan(PatchPlan),
    /// `mitigation` has no diff or overlay for this variant.
    Unbuildable { mitigation: String },
}

pub struct PatchResolver {
    patches_dir: PathBuf,
}

impl PatchResolver {
    pub fn new(patches_dir: impl Into<PathBuf>) -> Self {
        Self {
            patches_dir: patches_dir.into(),
        }
    }

    pub fn resolve(&self, variant: &VariantIdentity) -> ResolutionOutcome {
        let base = self.diff_for(&self.patches_dir, variant);
        let mut mitigations = Vec::with_capacity(variant.mitigations().len());
        for mitigation in variant.mitigations() {
            let steps = self.steps_for(variant, mitigation);
            if steps.is_empty() {
                return ResolutionOutcome::Unbuildable {
                    mitigation: mitigation.clone(),
                };
            }
            mitigations.push(MitigationPatches {
                mitigation: mitigation.clone(),
                steps,
            });
        }
        ResolutionOutcome::Plan(PatchPlan { base, mitigations })
    }

    /// Version-specific diff, else the family-generic one.
    fn diff_for(&self, dir: &Path, variant: &VariantIdentity) -> Option<PathBuf> {
        let specific = dir.join(format!("{}.patch", variant.release()));
        if specific.is_file() {
            return Some(specific);
        }
        let generic = dir.join(format!("{}.patch", variant.family().basename()));
        generic.is_file().then_some(generic)
    }

    fn steps_for(&self, variant: &VariantIdentity, mitigation: &str) -> Vec<PatchStep> {
        let dir = self.patches_dir.join(mitigation);
        let mut steps = Vec::new();
        if let Some(diff) = self.diff_for(&dir, variant) {
            steps.push(PatchStep::Diff(diff));
        }
        let generic = dir.join(variant.family().basename());
        let specific = dir.join(variant.release());
        if generic.is_dir() {
            steps.push(PatchStep::Overlay(generic.clone()));
        }
        // Single-version families share one directory for both.
        if specific != generic && specific.is_dir() {
            steps.push(PatchStep::Overlay(specific));
        }
        steps
    }
}

impl PatchPlan {
    /// Applies the plan to `work_dir` in place. Overlays overwrite earlier
    /// files at the same path; when the earlier file came from a different
    /// mitigation a warning is logged.
    pub fn apply(&self, work_dir: &Path, toolchain: &dyn Toolchain) -> Result<()> {
        if let Some(base) = &self.base {
            debug!("Applying base patch {}...", base.display());
            apply_diff(base, work_dir, toolchain)?;
        }
        let mut owners: BTreeMap<PathBuf, &str> = BTreeMap::new();
        for entry in &self.mitigations {
            debug!("Applying patch {}...", entry.mitigation);
            for step in &entry.steps {
                match step {
                    PatchStep::Diff(path) => apply_diff(path, work_dir, toolchain)?,
                    PatchStep::Overlay(dir) => {
                        debug!("copy {} to {}", dir.display(), work_dir.display());
                        let owner = entry.mitigation.as_str();
                        for rel in copy_dir_filtered(dir, work_dir, &[])? {
                            if let Some(previous) = owners.insert(rel.clone(), owner) {
                                if previous != entry.mitigation {
                                    warn!(
                                        "overlay conflict: {} from '{}' overwrites '{}'",
                                        rel.display(),
                                        entry.mitigation,
                                        previous
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn apply_diff(patch: &Path, work_dir: &Path, toolchain: &dyn Toolchain) -> Result<()> {
    debug!("patch < {}", patch.display());
    let args = vec![
        "-p1".to_string(),
        "-i".to_string(),
        patch.to_string_lossy().to_string(),
    ];
    run_tool(toolchain, "patch", &args, Some(work_dir))
}
