//! Exploits rendered from Lua templates.
//!
//! Each exploit is a directory `<code>/exploits/<name>/` holding an
//! `exploit.yaml` manifest and one or more templates:
//!
//! ```text
//! <release>.lua.template    e.g. lua-5.4.6.lua.template
//! <family>.lua.template     e.g. LuaJIT.lua.template
//! exploit.lua.template
//! ```
//!
//! The first one found for the target interpreter is rendered into
//! `<work>/temp/exploits/<name>/<release>.lua`.

use crate::build::Interpreter;
use crate::checker::ExploitChecker;
use anyhow::{anyhow, bail, Context, Result};
use bench_core::{ensure_dir, BenchConfig, BenchError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const MANIFEST_FILE: &str = "exploit.yaml";
const TEMPLATE_SUFFIX: &str = ".lua.template";
const GENERIC_TEMPLATE: &str = "exploit";

/// Produces a payload script for one interpreter.
pub trait Exploit {
    fn name(&self) -> &str;

    fn prepare(&mut self) -> Result<()>;

    /// Generates the payload targeting `interpreter`, which is always an
    /// unmitigated build.
    fn compile(&mut self, interpreter: &Interpreter, checker: &dyn ExploitChecker) -> Result<()>;

    /// Where the last `compile` put its payload. The file may not exist.
    fn exploit_path(&self) -> PathBuf;
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExploitManifest {
    #[serde(default)]
    pub description: String,
    /// Family basenames the exploit applies to; empty means all.
    #[serde(default)]
    pub families: Vec<String>,
    /// Extra template values.
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

pub struct TemplateExploit {
    name: String,
    source_dir: PathBuf,
    out_dir: PathBuf,
    manifest: ExploitManifest,
    payload: PathBuf,
}

impl TemplateExploit {
    pub fn load(config: &BenchConfig, name: &str) -> Result<Self> {
        let source_dir = config.exploits_dir().join(name);
        let manifest_path = source_dir.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(BenchError::UnknownExploit(name.to_string()).into());
        }
        let raw = fs::read_to_string(&manifest_path)
            .with_context(|| format!("read {}", manifest_path.display()))?;
        let manifest: ExploitManifest = serde_yaml::from_str(&raw)
            .with_context(|| format!("parse {}", manifest_path.display()))?;
        let out_dir = config.temp_dir().join("exploits").join(name);
        let payload = out_dir.join(format!("{}.lua", GENERIC_TEMPLATE));
        Ok(Self {
            name: name.to_string(),
            source_dir,
            out_dir,
            manifest,
            payload,
        })
    }

    pub fn manifest(&self) -> &ExploitManifest {
        &self.manifest
    }

    fn applies_to(&self, interpreter: &Interpreter) -> bool {
        let basename = interpreter.identity().family().basename();
        self.manifest.families.is_empty() || self.manifest.families.iter().any(|f| f == basename)
    }

    fn template_for(&self, interpreter: &Interpreter) -> Option<PathBuf> {
        let identity = interpreter.identity();
        [
            identity.release(),
            identity.family().basename().to_string(),
            GENERIC_TEMPLATE.to_string(),
        ]
        .into_iter()
        .map(|stem| self.source_dir.join(format!("{}{}", stem, TEMPLATE_SUFFIX)))
        .find(|path| path.is_file())
    }

    fn values_for(
        &self,
        interpreter: &Interpreter,
        checker: &dyn ExploitChecker,
    ) -> BTreeMap<String, String> {
        let identity = interpreter.identity();
        let mut values = self.manifest.values.clone();
        values.insert("exploit".to_string(), self.name.clone());
        values.insert("interpreter".to_string(), interpreter.canonical_name());
        values.insert("release".to_string(), identity.release());
        values.insert("family".to_string(), identity.family().basename().to_string());
        values.insert("version".to_string(), identity.version().to_string());
        values.insert("work_dir".to_string(), escape_path(interpreter.work_dir()));
        if let Some(exe) = interpreter.exe() {
            values.insert("interpreter_exe".to_string(), escape_path(exe));
        }
        values.extend(checker.template_values());
        values
    }
}

impl Exploit for TemplateExploit {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&mut self) -> Result<()> {
        ensure_dir(&self.out_dir)
    }

    fn compile(&mut self, interpreter: &Interpreter, checker: &dyn ExploitChecker) -> Result<()> {
        self.payload = self
            .out_dir
            .join(format!("{}.lua", interpreter.identity().release()));
        if self.payload.exists() {
            fs::remove_file(&self.payload)
                .with_context(|| format!("remove stale {}", self.payload.display()))?;
        }
        if !self.applies_to(interpreter) {
            info!("{} - exploit {} does not target this family.", interpreter, self.name);
            return Ok(());
        }
        let Some(template) = self.template_for(interpreter) else {
            info!("{} - no template for exploit {}.", interpreter, self.name);
            return Ok(());
        };
        debug!("rendering {} to {}", template.display(), self.payload.display());
        let raw = fs::read_to_string(&template)
            .with_context(|| format!("read {}", template.display()))?;
        let rendered = render(&raw, &self.values_for(interpreter, checker))
            .with_context(|| format!("render {}", template.display()))?;
        ensure_dir(&self.out_dir)?;
        fs::write(&self.payload, rendered)
            .with_context(|| format!("write {}", self.payload.display()))?;
        Ok(())
    }

    fn exploit_path(&self) -> PathBuf {
        self.payload.clone()
    }
}

/// Doubles backslashes so a path survives inside a Lua or C string literal.
pub fn escape_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "\\\\")
}

/// Substitutes `{{ key }}` placeholders. Unknown keys are errors.
pub fn render(template: &str, values: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let offset = template.len() - rest.len() + start;
        let end = after
            .find("}}")
            .ok_or_else(|| anyhow!("unterminated placeholder at byte {}", offset))?;
        let key = after[..end].trim();
        match values.get(key) {
            Some(value) => out.push_str(value),
            None => bail!("unknown template value '{}'", key),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Names of the exploits found under `<code>/exploits/`, sorted.
pub fn list_exploits(config: &BenchConfig) -> Result<Vec<String>> {
    let dir = config.exploits_dir();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry?;
        if entry.path().join(MANIFEST_FILE).is_file() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();
    Ok(names)
}

pub fn create_exploit(config: &BenchConfig, name: &str) -> Result<Box<dyn Exploit>> {
    Ok(Box::new(TemplateExploit::load(config, name)?))
}
