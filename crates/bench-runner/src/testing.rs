use crate::toolchain::Toolchain;
use anyhow::Result;
use bench_core::BenchConfig;
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const FAKE_DIFF: &str = "--- a/src/lua.c\n+++ b/src/lua.c\n@@ -1 +1 @@\n-int x;\n+int y;\n";

/// Scratch code and work roots under the system temp dir, removed on drop.
pub(crate) struct Fixture {
    pub root: PathBuf,
    pub config: Arc<BenchConfig>,
}

impl Fixture {
    pub fn new(tag: &str) -> Self {
        let root = std::env::temp_dir().join(format!(
            "bench_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("create fixture root");
        let config = BenchConfig::new(root.join("code"), root.join("work"));
        Self {
            root,
            config: Arc::new(config),
        }
    }

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("create parent");
        fs::write(path, contents).expect("write fixture file");
    }

    /// PUC-style tree: `src/` plus a top-level `Makefile`.
    pub fn write_puc_source(&self, release: &str) {
        let dir = self.config.interpreters_code_dir().join(release);
        Self::write(&dir.join("src").join("lua.c"), "int x;\n");
        Self::write(&dir.join("Makefile"), "all:\n");
    }

    pub fn write_tree_source(&self, release: &str) {
        let dir = self.config.interpreters_code_dir().join(release);
        Self::write(&dir.join(".git").join("HEAD"), "ref: refs/heads/master\n");
        Self::write(&dir.join("CMakeLists.txt"), "project(luau)\n");
        Self::write(&dir.join("VM").join("src").join("lvm.cpp"), "\n");
    }

    pub fn write_patch(&self, rel: &str) {
        Self::write(&self.config.patches_dir().join(rel), FAKE_DIFF);
    }

    pub fn write_overlay_file(&self, rel: &str, contents: &str) {
        Self::write(&self.config.patches_dir().join(rel), contents);
    }

    pub fn write_exploit(&self, name: &str, templates: &[(&str, &str)]) {
        let dir = self.config.exploits_dir().join(name);
        Self::write(&dir.join("exploit.yaml"), "description: test exploit\n");
        for (file, contents) in templates {
            Self::write(&dir.join(file), contents);
        }
    }

    pub fn write_tool(&self, name: &str, script: &str) {
        let path = self
            .config
            .toolchain_bin_dir()
            .join(format!("{}{}", name, std::env::consts::EXE_SUFFIX));
        Self::write(&path, script);
        make_executable(&path);
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("chmod");
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) {}

/// Records every call. `make` drops an executable where the real build would
/// leave one; it runs its first argument as a shell script.
#[derive(Default)]
pub(crate) struct FakeToolchain {
    calls: Mutex<Vec<(String, Vec<String>)>>,
    failing: Option<(String, i32)>,
    without_outputs: bool,
}

impl FakeToolchain {
    pub fn failing(tool: &str, code: i32) -> Self {
        Self {
            failing: Some((tool.to_string(), code)),
            ..Self::default()
        }
    }

    pub fn without_outputs() -> Self {
        Self {
            without_outputs: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn count(&self, tool: &str) -> usize {
        self.calls().iter().filter(|(t, _)| t == tool).count()
    }

    fn make_output(args: &[String]) -> PathBuf {
        let dir = PathBuf::from(&args[1]);
        let exe = |stem: &str| format!("{}{}", stem, std::env::consts::EXE_SUFFIX);
        if args.iter().any(|a| a == "config=release") {
            dir.join("build").join("release").join(exe("luau"))
        } else if args.len() == 3 {
            dir.join("src").join(exe("lua"))
        } else {
            dir.join(exe("luajit"))
        }
    }
}

impl Toolchain for FakeToolchain {
    fn invoke(&self, tool: &str, args: &[String], _cwd: Option<&Path>) -> Result<i32> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((tool.to_string(), args.to_vec()));
        if let Some((failing, code)) = &self.failing {
            if failing == tool {
                return Ok(*code);
            }
        }
        if tool == "make" && !self.without_outputs {
            let out = Self::make_output(args);
            Fixture::write(&out, "#!/bin/sh\nexec /bin/sh \"$@\"\n");
            make_executable(&out);
        }
        Ok(0)
    }
}
