use crate::error::BenchError;
use std::fmt;
use std::path::{Path, PathBuf};

/// Every interpreter release the benchmark knows how to build.
pub const INTERPRETERS: &[&str] = &[
    "lua-5.1.5",
    "lua-5.2.4",
    "lua-5.3.6",
    "lua-5.4.6",
    "LuaJIT-4f8736",
    "LuaJIT-rolling",
    "LuaJIT-v2.1.0-beta3",
    "luau",
];

/// Every mitigation the patch repository may provide.
pub const MITIGATIONS: &[&str] = &[
    "disable_bytecode",
    "disable_ffi",
    "stdlibrary_sandbox",
    "kikito_sandbox",
];

/// Mitigation that is enforced at run time by a Lua wrapper script instead of
/// (or in addition to) a source change.
pub const RUNTIME_WRAPPER_MITIGATION: &str = "kikito_sandbox";

/// File name of the wrapper script inside the variant working directory.
pub const RUNTIME_WRAPPER_SCRIPT: &str = "runner.lua";

pub fn validate_mitigation(name: &str) -> Result<(), BenchError> {
    if MITIGATIONS.contains(&name) {
        Ok(())
    } else {
        Err(BenchError::UnknownMitigation(name.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// Reference PUC-Rio implementation.
    Puc,
    Jit,
    Luau,
}

/// Which part of the pristine tree is copied into a working directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLayout {
    /// `src/` plus the top-level `Makefile`.
    SrcAndMakefile,
    /// Everything except VCS metadata.
    WholeTree,
}

impl Family {
    pub fn basename(self) -> &'static str {
        match self {
            Family::Puc => "lua",
            Family::Jit => "LuaJIT",
            Family::Luau => "luau",
        }
    }

    /// Families that ship a single, unversioned source tree.
    pub fn is_single_version(self) -> bool {
        matches!(self, Family::Luau)
    }

    /// PUC-Lua sources are fetched on demand; the other families are vendored
    /// next to the patch repository.
    pub fn is_downloadable(self) -> bool {
        matches!(self, Family::Puc)
    }

    pub fn source_layout(self) -> SourceLayout {
        match self {
            Family::Puc => SourceLayout::SrcAndMakefile,
            Family::Jit | Family::Luau => SourceLayout::WholeTree,
        }
    }

    /// Arguments for the single `make` invocation that builds a working copy.
    pub fn make_args(self, work_dir: &Path) -> Vec<String> {
        let dir = work_dir.to_string_lossy().to_string();
        match self {
            Family::Puc => vec!["-C".to_string(), dir, host_make_target().to_string()],
            Family::Jit => vec![
                "-C".to_string(),
                work_dir.join("src").to_string_lossy().to_string(),
            ],
            Family::Luau => vec![
                "-C".to_string(),
                dir,
                "config=release".to_string(),
                "luau".to_string(),
            ],
        }
    }

    /// Where the toolchain leaves the executable, relative to the working copy.
    pub fn built_rel_path(self) -> PathBuf {
        match self {
            Family::Puc => Path::new("src").join(exe_name("lua")),
            Family::Jit => Path::new("src").join(exe_name("luajit")),
            Family::Luau => Path::new("build").join("release").join(exe_name("luau")),
        }
    }

    /// Where the benchmark expects the finished executable. A file at this
    /// location is what makes a working copy count as built.
    pub fn artifact_rel_path(self) -> PathBuf {
        match self {
            Family::Puc | Family::Jit => self.built_rel_path(),
            Family::Luau => PathBuf::from(exe_name("luau")),
        }
    }
}

fn host_make_target() -> &'static str {
    match std::env::consts::OS {
        "windows" => "mingw",
        "macos" => "macosx",
        _ => "linux",
    }
}

fn exe_name(stem: &str) -> String {
    format!("{}{}", stem, std::env::consts::EXE_SUFFIX)
}

/// An interpreter family and version with an ordered list of mitigations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariantIdentity {
    family: Family,
    version: String,
    mitigations: Vec<String>,
}

impl VariantIdentity {
    pub fn new(family: Family, version: impl Into<String>) -> Self {
        let version = if family.is_single_version() {
            String::new()
        } else {
            version.into()
        };
        Self {
            family,
            version,
            mitigations: Vec::new(),
        }
    }

    /// Parses a release label from the interpreter catalog, e.g. `lua-5.4.6`.
    pub fn parse(name: &str) -> Result<Self, BenchError> {
        if !INTERPRETERS.contains(&name) {
            return Err(BenchError::UnknownInterpreter(name.to_string()));
        }
        Self::from_release(name).ok_or_else(|| BenchError::UnknownInterpreter(name.to_string()))
    }

    /// Splits a release label into family and version without consulting the
    /// catalog.
    pub fn from_release(name: &str) -> Option<Self> {
        if name == Family::Luau.basename() {
            return Some(Self::new(Family::Luau, ""));
        }
        for family in [Family::Puc, Family::Jit] {
            let prefix = format!("{}-", family.basename());
            if let Some(version) = name.strip_prefix(&prefix) {
                if !version.is_empty() {
                    return Some(Self::new(family, version));
                }
            }
        }
        None
    }

    pub fn with_mitigations<I, S>(mut self, mitigations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mitigations = mitigations.into_iter().map(Into::into).collect();
        self
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn mitigations(&self) -> &[String] {
        &self.mitigations
    }

    pub fn has_mitigation(&self, name: &str) -> bool {
        self.mitigations.iter().any(|m| m == name)
    }

    /// Family basename joined with the version: `lua-5.4.6`, `LuaJIT-rolling`,
    /// or just `luau`.
    pub fn release(&self) -> String {
        if self.version.is_empty() {
            self.family.basename().to_string()
        } else {
            format!("{}-{}", self.family.basename(), self.version)
        }
    }

    pub fn canonical_name(&self) -> String {
        if self.mitigations.is_empty() {
            self.release()
        } else {
            format!("{}_{}", self.release(), self.mitigations.join("-"))
        }
    }

    /// Same family and version, no mitigations.
    pub fn unpatched(&self) -> Self {
        Self {
            family: self.family,
            version: self.version.clone(),
            mitigations: Vec::new(),
        }
    }

    /// Appends one mitigation after the ones already baked in.
    pub fn with_mitigation(&self, mitigation: &str) -> Self {
        let mut derived = self.clone();
        derived.mitigations.push(mitigation.to_string());
        derived
    }

    /// Name of the wrapper script the interpreter has to be started through,
    /// fixed by the mitigation set at construction time.
    pub fn runtime_wrapper(&self) -> Option<&'static str> {
        if self.has_mitigation(RUNTIME_WRAPPER_MITIGATION) {
            Some(RUNTIME_WRAPPER_SCRIPT)
        } else {
            None
        }
    }
}

impl fmt::Display for VariantIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_name_without_mitigations_is_release() {
        let v = VariantIdentity::new(Family::Puc, "5.4.6");
        assert_eq!(v.canonical_name(), "lua-5.4.6");
        assert_eq!(VariantIdentity::new(Family::Luau, "ignored").canonical_name(), "luau");
    }

    #[test]
    fn canonical_name_joins_mitigations_in_order() {
        let v = VariantIdentity::new(Family::Jit, "4f8736")
            .with_mitigations(["disable_ffi", "disable_bytecode"]);
        assert_eq!(v.canonical_name(), "LuaJIT-4f8736_disable_ffi-disable_bytecode");
        let swapped = VariantIdentity::new(Family::Jit, "4f8736")
            .with_mitigations(["disable_bytecode", "disable_ffi"]);
        assert_ne!(v.canonical_name(), swapped.canonical_name());
    }

    #[test]
    fn canonical_name_is_stable_across_equal_values() {
        let a = VariantIdentity::parse("lua-5.1.5").expect("known").with_mitigation("disable_ffi");
        let b = VariantIdentity::new(Family::Puc, "5.1.5").with_mitigations(vec!["disable_ffi"]);
        assert_eq!(a, b);
        assert_eq!(a.canonical_name(), b.canonical_name());
        assert_eq!(a.canonical_name(), a.canonical_name());
    }

    #[test]
    fn parse_accepts_every_catalog_entry() {
        for name in INTERPRETERS {
            let v = VariantIdentity::parse(name).expect("catalog entry must parse");
            assert_eq!(&v.canonical_name(), name);
        }
    }

    #[test]
    fn parse_rejects_unknown_release() {
        let err = VariantIdentity::parse("lua-9.9.9").expect_err("not in catalog");
        assert!(matches!(err, BenchError::UnknownInterpreter(_)));
        assert!(VariantIdentity::from_release("python-3.12").is_none());
        assert!(VariantIdentity::from_release("lua-").is_none());
    }

    #[test]
    fn unpatched_drops_mitigations_only() {
        let v = VariantIdentity::parse("LuaJIT-rolling")
            .expect("known")
            .with_mitigations(["disable_ffi"]);
        let base = v.unpatched();
        assert_eq!(base.canonical_name(), "LuaJIT-rolling");
        assert_eq!(base.family(), Family::Jit);
        assert!(base.mitigations().is_empty());
    }

    #[test]
    fn runtime_wrapper_follows_mitigation_set() {
        let plain = VariantIdentity::parse("luau").expect("known");
        assert_eq!(plain.runtime_wrapper(), None);
        let wrapped = plain.with_mitigation(RUNTIME_WRAPPER_MITIGATION);
        assert_eq!(wrapped.runtime_wrapper(), Some(RUNTIME_WRAPPER_SCRIPT));
    }

    #[test]
    fn family_table_matches_toolchain_layout() {
        let work = Path::new("/w");
        let puc = Family::Puc.make_args(work);
        assert_eq!(puc[0], "-C");
        assert_eq!(puc.len(), 3);
        let jit = Family::Jit.make_args(work);
        assert_eq!(jit[1], work.join("src").to_string_lossy());
        let luau = Family::Luau.make_args(work);
        assert_eq!(&luau[2..], ["config=release", "luau"]);
        assert_ne!(Family::Luau.built_rel_path(), Family::Luau.artifact_rel_path());
        assert_eq!(Family::Puc.built_rel_path(), Family::Puc.artifact_rel_path());
    }

    #[test]
    fn validate_mitigation_rejects_unknown_names() {
        assert!(validate_mitigation("disable_ffi").is_ok());
        assert!(matches!(
            validate_mitigation("nope"),
            Err(BenchError::UnknownMitigation(_))
        ));
    }
}
