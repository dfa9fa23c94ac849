pub mod build;
pub mod checker;
pub mod exploit;
pub mod patches;
pub mod provision;
pub mod sandbox;
pub mod toolchain;

#[cfg(test)]
pub(crate) mod testing;

pub use build::{BuildArtifact, BuildPipeline, Interpreter};
pub use checker::{create_checker, ArbitraryWriteChecker, ExploitChecker, CHECKERS};
pub use exploit::{create_exploit, list_exploits, Exploit, TemplateExploit};
pub use patches::{PatchPlan, PatchResolver, ResolutionOutcome};
pub use provision::{ArchiveProvisioner, Provisioner};
pub use sandbox::{ExecutionOutcome, ExecutionSandbox};
pub use toolchain::{LocalToolchain, Toolchain};

use anyhow::Result;
use bench_core::{BenchError, StreamPolicy};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::process::Stdio;
use tracing::{debug, info, warn};

pub(crate) fn stdio_for(policy: StreamPolicy) -> Stdio {
    match policy {
        StreamPolicy::Inherit => Stdio::inherit(),
        StreamPolicy::Discard => Stdio::null(),
    }
}

/// Verdicts for one variant, keyed by exploit name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariantRow {
    pub variant: String,
    pub exploits: BTreeMap<String, bool>,
}

/// Variant → exploit → exploited. Rows stay in evaluation order and no
/// verdict is ever overwritten.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BenchmarkResult {
    rows: Vec<VariantRow>,
}

impl BenchmarkResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[VariantRow] {
        &self.rows
    }

    pub fn variants(&self) -> Vec<&str> {
        self.rows.iter().map(|r| r.variant.as_str()).collect()
    }

    pub fn get(&self, variant: &str) -> Option<&BTreeMap<String, bool>> {
        self.rows
            .iter()
            .find(|r| r.variant == variant)
            .map(|r| &r.exploits)
    }

    pub fn verdict(&self, variant: &str, exploit: &str) -> Option<bool> {
        self.get(variant).and_then(|e| e.get(exploit).copied())
    }

    pub fn contains(&self, variant: &str) -> bool {
        self.get(variant).is_some()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Opens a row for `variant`. Returns false when the row already exists.
    pub fn begin_variant(&mut self, variant: &str) -> bool {
        if self.contains(variant) {
            return false;
        }
        self.rows.push(VariantRow {
            variant: variant.to_string(),
            exploits: BTreeMap::new(),
        });
        true
    }

    /// Records a verdict, creating the row if needed. An existing verdict is
    /// kept and a warning logged.
    pub fn record(&mut self, variant: &str, exploit: &str, exploited: bool) {
        self.begin_variant(variant);
        let Some(row) = self.rows.iter_mut().find(|r| r.variant == variant) else {
            return;
        };
        if row.exploits.contains_key(exploit) {
            warn!("{} - {} already recorded, keeping first verdict", variant, exploit);
            return;
        }
        row.exploits.insert(exploit.to_string(), exploited);
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "generated_at": Utc::now().to_rfc3339(),
            "results": self.rows,
        })
    }
}

/// Classifies an error raised while building a variant. Build-scoped failures
/// drop the variant in sweep mode; typed configuration errors abort the run.
/// Errors from preparing, compiling or running a trial are always fatal and
/// never pass through here.
pub fn is_run_fatal(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<BenchError>())
        .any(|e| !e.is_build_failure())
}

pub struct BenchRunner {
    pipeline: BuildPipeline,
    sandbox: ExecutionSandbox,
}

impl BenchRunner {
    pub fn new(pipeline: BuildPipeline) -> Self {
        let sandbox = ExecutionSandbox::new(pipeline.config());
        Self { pipeline, sandbox }
    }

    pub fn with_sandbox(mut self, sandbox: ExecutionSandbox) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn pipeline(&self) -> &BuildPipeline {
        &self.pipeline
    }

    /// One interpreter × exploit × checker trial. The exploit is always
    /// compiled against the unmitigated build of the same release.
    pub fn run_single(
        &self,
        interpreter: &Interpreter,
        exploit: &mut dyn Exploit,
        checker: &mut dyn ExploitChecker,
    ) -> Result<bool> {
        let baseline = self.pipeline.unpatched(interpreter)?;
        self.trial(interpreter, &baseline, exploit, checker)
    }

    /// Prepare, compile against `baseline`, arm the checker, run, judge.
    fn trial(
        &self,
        interpreter: &Interpreter,
        baseline: &Interpreter,
        exploit: &mut dyn Exploit,
        checker: &mut dyn ExploitChecker,
    ) -> Result<bool> {
        exploit.prepare()?;
        exploit.compile(baseline, &*checker)?;
        checker.prepare()?;
        let outcome = self
            .sandbox
            .execute(interpreter, &exploit.exploit_path(), None)?;
        debug!("{} - {}: {:?}", interpreter, exploit.name(), outcome);
        let exploited = checker.is_exploited();
        info!("{} - {}: exploited={}", interpreter, exploit.name(), exploited);
        Ok(exploited)
    }

    /// Runs every exploit against every interpreter, then against each
    /// interpreter with one more mitigation appended. Inapplicable
    /// mitigations and variants that fail to build are logged and left out.
    pub fn run_matrix(
        &self,
        interpreters: &[Interpreter],
        exploits: &mut [Box<dyn Exploit>],
        mitigations: &[String],
        checker: &mut dyn ExploitChecker,
    ) -> Result<BenchmarkResult> {
        let mut result = BenchmarkResult::new();
        for interpreter in interpreters {
            self.run_row(&mut result, interpreter, exploits, checker)?;
            for mitigation in mitigations {
                if interpreter.identity().has_mitigation(mitigation) {
                    debug!("{} already carries {}, skipping.", interpreter, mitigation);
                    continue;
                }
                let patched = match self.pipeline.patched(interpreter, mitigation) {
                    Ok(Some(patched)) => patched,
                    Ok(None) => {
                        info!(
                            "Mitigation '{}' not applicable to '{}'.",
                            mitigation, interpreter
                        );
                        continue;
                    }
                    Err(err) if !is_run_fatal(&err) => {
                        warn!(
                            "{} with {} failed to build, dropping: {:#}",
                            interpreter, mitigation, err
                        );
                        continue;
                    }
                    Err(err) => return Err(err),
                };
                self.run_row(&mut result, &patched, exploits, checker)?;
            }
        }
        Ok(result)
    }

    fn run_row(
        &self,
        result: &mut BenchmarkResult,
        interpreter: &Interpreter,
        exploits: &mut [Box<dyn Exploit>],
        checker: &mut dyn ExploitChecker,
    ) -> Result<()> {
        let variant = interpreter.canonical_name();
        if result.contains(&variant) {
            warn!("{} evaluated twice, keeping first row", variant);
            return Ok(());
        }
        let baseline = match self.pipeline.unpatched(interpreter) {
            Ok(baseline) => baseline,
            Err(err) if !is_run_fatal(&err) => {
                warn!("{} dropped, no baseline build: {:#}", variant, err);
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let mut verdicts = Vec::with_capacity(exploits.len());
        for exploit in exploits.iter_mut() {
            let exploited = self.trial(interpreter, &baseline, exploit.as_mut(), checker)?;
            verdicts.push((exploit.name().to_string(), exploited));
        }
        result.begin_variant(&variant);
        for (exploit, exploited) in verdicts {
            result.record(&variant, &exploit, exploited);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeToolchain, Fixture};
    use anyhow::Context;
    use bench_core::{Family, VariantIdentity};
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Arc;

    /// Writes a shell payload that creates the checker's target file.
    struct WritingExploit {
        name: String,
        out: PathBuf,
        write_payload: bool,
    }

    impl WritingExploit {
        fn boxed(fx: &Fixture, name: &str, write_payload: bool) -> Box<dyn Exploit> {
            Box::new(Self {
                name: name.to_string(),
                out: fx.root.join("payloads").join(format!("{}.lua", name)),
                write_payload,
            })
        }
    }

    impl Exploit for WritingExploit {
        fn name(&self) -> &str {
            &self.name
        }

        fn prepare(&mut self) -> Result<()> {
            let _ = fs::remove_file(&self.out);
            bench_core::ensure_dir(self.out.parent().context("payload dir")?)
        }

        fn compile(
            &mut self,
            interpreter: &Interpreter,
            checker: &dyn ExploitChecker,
        ) -> Result<()> {
            assert!(interpreter.identity().mitigations().is_empty());
            if self.write_payload {
                let target = checker
                    .template_values()
                    .remove("exploited_file")
                    .context("target")?;
                fs::write(&self.out, format!(": > '{}'\n", target))?;
            }
            Ok(())
        }

        fn exploit_path(&self) -> PathBuf {
            self.out.clone()
        }
    }

    /// Fails to render, as a template with an unknown placeholder would.
    struct BrokenTemplateExploit;

    impl Exploit for BrokenTemplateExploit {
        fn name(&self) -> &str {
            "broken"
        }

        fn prepare(&mut self) -> Result<()> {
            Ok(())
        }

        fn compile(&mut self, _: &Interpreter, _: &dyn ExploitChecker) -> Result<()> {
            anyhow::bail!("unknown template value 'oops'")
        }

        fn exploit_path(&self) -> PathBuf {
            PathBuf::from("broken.lua")
        }
    }

    fn runner(fx: &Fixture) -> BenchRunner {
        let toolchain = Arc::new(FakeToolchain::default());
        BenchRunner::new(BuildPipeline::new(fx.config.clone(), toolchain))
    }

    fn checker(fx: &Fixture) -> ArbitraryWriteChecker {
        ArbitraryWriteChecker::new(fx.config.exploited_dir())
    }

    fn matrix_fixture(tag: &str) -> Fixture {
        let fx = Fixture::new(tag);
        fx.write_puc_source("lua-5.4.6");
        fx.write_puc_source("lua-5.1.5");
        fx.write_patch("disable_ffi/lua-5.4.6.patch");
        fx
    }

    fn interpreters(runner: &BenchRunner) -> Vec<Interpreter> {
        ["5.4.6", "5.1.5"]
            .into_iter()
            .map(|v| {
                runner
                    .pipeline()
                    .interpreter(&VariantIdentity::new(Family::Puc, v), false)
                    .expect("build")
            })
            .collect()
    }

    #[test]
    fn result_never_overwrites_a_verdict() {
        let mut result = BenchmarkResult::new();
        result.record("lua-5.4.6", "e1", true);
        result.record("lua-5.4.6", "e1", false);
        result.record("luau", "e1", false);
        assert_eq!(result.verdict("lua-5.4.6", "e1"), Some(true));
        assert_eq!(result.variants(), vec!["lua-5.4.6", "luau"]);
        assert!(!result.begin_variant("luau"));
        assert_eq!(result.to_json()["results"][1]["variant"], "luau");
    }

    #[test]
    fn fatal_errors_are_typed_configuration_errors() {
        let build: anyhow::Error = BenchError::ToolFailed {
            tool: "make".to_string(),
            code: 2,
        }
        .into();
        assert!(!is_run_fatal(&build.context("build lua-5.4.6")));
        let config: anyhow::Error = BenchError::ToolchainMissing(PathBuf::from("/t")).into();
        assert!(is_run_fatal(&config.context("build lua-5.4.6")));
        assert!(!is_run_fatal(&anyhow::anyhow!("io hiccup")));
    }

    #[test]
    fn missing_exploit_input_is_a_skip_not_a_failure() {
        let fx = Fixture::new("run_skip");
        let interp = Interpreter::new(
            VariantIdentity::new(Family::Puc, "5.4.6"),
            fx.root.clone(),
            BuildArtifact::Built(PathBuf::from("/bin/sh")),
        );
        let mut exploit = WritingExploit::boxed(&fx, "e1", false);
        let exploited = runner(&fx)
            .run_single(&interp, exploit.as_mut(), &mut checker(&fx))
            .expect("skip is not an error");
        assert!(!exploited);
    }

    #[test]
    fn broken_exploit_template_aborts_the_matrix() {
        let fx = Fixture::new("matrix_broken_template");
        let interp = Interpreter::new(
            VariantIdentity::new(Family::Puc, "5.4.6"),
            fx.root.clone(),
            BuildArtifact::Built(PathBuf::from("/bin/sh")),
        );
        let mut exploits: Vec<Box<dyn Exploit>> = vec![Box::new(BrokenTemplateExploit)];
        let err = runner(&fx)
            .run_matrix(&[interp], &mut exploits, &[], &mut checker(&fx))
            .expect_err("compile errors are fatal");
        assert!(format!("{:#}", err).contains("unknown template value 'oops'"));
    }

    #[test]
    fn failed_derived_patch_drops_only_that_variant() {
        let fx = Fixture::new("matrix_patch_fails");
        fx.write_puc_source("lua-5.4.6");
        fx.write_patch("disable_ffi/lua.patch");
        let toolchain = Arc::new(FakeToolchain::failing("patch", 1));
        let runner = BenchRunner::new(BuildPipeline::new(fx.config.clone(), toolchain.clone()));
        let base = runner
            .pipeline()
            .interpreter(&VariantIdentity::new(Family::Puc, "5.4.6"), false)
            .expect("base needs no patch");
        let mut exploits = vec![WritingExploit::boxed(&fx, "e1", false)];

        let result = runner
            .run_matrix(
                &[base],
                &mut exploits,
                &["disable_ffi".to_string()],
                &mut checker(&fx),
            )
            .expect("patch failure is not fatal");
        assert_eq!(result.variants(), vec!["lua-5.4.6"]);
        assert_eq!(result.verdict("lua-5.4.6", "e1"), Some(false));
        assert_eq!(toolchain.count("patch"), 1);
        let derived = VariantIdentity::new(Family::Puc, "5.4.6").with_mitigation("disable_ffi");
        assert!(!fx.config.variant_dir(&derived).exists());
    }

    #[test]
    fn missing_toolchain_during_derived_build_aborts_the_matrix() {
        let fx = Fixture::new("matrix_no_toolchain");
        fx.write_puc_source("lua-5.4.6");
        fx.write_patch("disable_ffi/lua.patch");
        let base = runner(&fx)
            .pipeline()
            .interpreter(&VariantIdentity::new(Family::Puc, "5.4.6"), false)
            .expect("base");
        let local = Arc::new(LocalToolchain::new(fx.config.clone()));
        let runner = BenchRunner::new(BuildPipeline::new(fx.config.clone(), local));
        let mut exploits = vec![WritingExploit::boxed(&fx, "e1", false)];

        let err = runner
            .run_matrix(
                &[base],
                &mut exploits,
                &["disable_ffi".to_string()],
                &mut checker(&fx),
            )
            .expect_err("configuration errors abort");
        assert!(is_run_fatal(&err));
        assert!(err.chain().any(|e| matches!(
            e.downcast_ref::<BenchError>(),
            Some(BenchError::ToolchainMissing(_))
        )));
    }

    #[cfg(unix)]
    #[test]
    fn matrix_has_one_row_per_interpreter_and_exploit() {
        let fx = matrix_fixture("matrix_complete");
        let runner = runner(&fx);
        let interps = interpreters(&runner);
        let mut exploits = vec![WritingExploit::boxed(&fx, "e1", true)];

        let result = runner
            .run_matrix(&interps, &mut exploits, &[], &mut checker(&fx))
            .expect("matrix");
        assert_eq!(result.variants(), vec!["lua-5.4.6", "lua-5.1.5"]);
        assert_eq!(result.verdict("lua-5.4.6", "e1"), Some(true));
        assert_eq!(result.get("lua-5.1.5").map(|e| e.len()), Some(1));
    }

    #[cfg(unix)]
    #[test]
    fn matrix_expands_applicable_mitigations_only() {
        let fx = matrix_fixture("matrix_mitigations");
        let runner = runner(&fx);
        let interps = interpreters(&runner);
        let mut exploits = vec![
            WritingExploit::boxed(&fx, "e1", true),
            WritingExploit::boxed(&fx, "e2", false),
        ];
        let mitigations = vec!["disable_ffi".to_string()];

        let result = runner
            .run_matrix(&interps, &mut exploits, &mitigations, &mut checker(&fx))
            .expect("matrix");
        assert_eq!(
            result.variants(),
            vec!["lua-5.4.6", "lua-5.4.6_disable_ffi", "lua-5.1.5"]
        );
        assert_eq!(result.verdict("lua-5.4.6_disable_ffi", "e1"), Some(true));
        assert_eq!(result.verdict("lua-5.4.6_disable_ffi", "e2"), Some(false));
        assert!(!result.contains("lua-5.1.5_disable_ffi"));
    }

    #[cfg(unix)]
    #[test]
    fn baked_in_mitigations_are_not_reapplied() {
        let fx = matrix_fixture("matrix_baked");
        let runner = runner(&fx);
        let base = runner
            .pipeline()
            .interpreter(&VariantIdentity::new(Family::Puc, "5.4.6"), false)
            .expect("build");
        let patched = runner
            .pipeline()
            .patched(&base, "disable_ffi")
            .expect("build")
            .expect("applicable");
        let mut exploits = vec![WritingExploit::boxed(&fx, "e1", true)];
        let result = runner
            .run_matrix(
                &[patched],
                &mut exploits,
                &["disable_ffi".to_string()],
                &mut checker(&fx),
            )
            .expect("matrix");
        assert_eq!(result.variants(), vec!["lua-5.4.6_disable_ffi"]);
    }

    #[cfg(unix)]
    #[test]
    fn matrix_is_deterministic() {
        let fx = matrix_fixture("matrix_determinism");
        let runner = runner(&fx);
        let interps = interpreters(&runner);
        let mitigations = vec!["disable_ffi".to_string(), "disable_bytecode".to_string()];
        let run = || {
            let mut exploits = vec![
                WritingExploit::boxed(&fx, "e1", true),
                WritingExploit::boxed(&fx, "e2", false),
            ];
            runner
                .run_matrix(&interps, &mut exploits, &mitigations, &mut checker(&fx))
                .expect("matrix")
        };
        let first = run();
        let second = run();
        assert_eq!(first, second);
    }
}
