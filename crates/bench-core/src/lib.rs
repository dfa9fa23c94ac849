pub mod config;
pub mod error;
pub mod variant;

pub use config::{load_config_file, BenchConfig, ConfigFile, LogLevel, StreamPolicy};
pub use error::BenchError;
pub use variant::{
    validate_mitigation, Family, SourceLayout, VariantIdentity, INTERPRETERS, MITIGATIONS,
    RUNTIME_WRAPPER_MITIGATION, RUNTIME_WRAPPER_SCRIPT,
};

use anyhow::{Context, Result};
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::debug;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create {}", path.display()))
}

/// Removes a directory tree, treating "already gone" as success.
pub fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            debug!("deleted {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}

/// Copies `src` over `dst`, overwriting existing files and skipping any
/// relative path that starts with an entry of `exclude`. Returns the relative
/// paths of the files written, in walk order.
pub fn copy_dir_filtered(src: &Path, dst: &Path, exclude: &[&str]) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    let walker = walkdir::WalkDir::new(src)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let rel = e.path().strip_prefix(src).unwrap_or(e.path());
            if rel.as_os_str().is_empty() {
                return true; // root entry
            }
            !exclude.iter().any(|ex| rel.starts_with(ex))
        });
    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", src.display()))?;
        let path = entry.path();
        let rel = match path.strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
            _ => continue,
        };
        let target = dst.join(&rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else if entry.file_type().is_symlink() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            match fs::canonicalize(path) {
                Ok(real) if real.is_dir() => {
                    for nested in copy_dir_filtered(&real, &target, &[])? {
                        written.push(rel.join(nested));
                    }
                }
                Ok(real) if real.is_file() => {
                    copy_file(&real, &target)?;
                    written.push(rel);
                }
                Ok(_) => {}
                Err(_) => {
                    // Keep dangling links as links.
                    let link_target = fs::read_link(path)?;
                    if target.exists() {
                        let _ = fs::remove_file(&target);
                    }
                    #[cfg(unix)]
                    {
                        symlink(&link_target, &target)?;
                    }
                    #[cfg(not(unix))]
                    {
                        let _ = link_target;
                    }
                }
            }
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            copy_file(path, &target)?;
            written.push(rel);
        }
    }
    Ok(written)
}

fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst)
        .map(|_| ())
        .with_context(|| format!("copy {} to {}", src.display(), dst.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "bench_core_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("scratch dir");
        dir
    }

    #[test]
    fn copy_dir_filtered_skips_excluded_prefixes() {
        let root = scratch("copy");
        let src = root.join("src");
        ensure_dir(&src.join(".git")).expect("git dir");
        ensure_dir(&src.join("src")).expect("src dir");
        fs::write(src.join(".git").join("HEAD"), "ref").expect("write");
        fs::write(src.join("src").join("lua.c"), "int main;").expect("write");
        fs::write(src.join("Makefile"), "all:").expect("write");

        let dst = root.join("dst");
        let written = copy_dir_filtered(&src, &dst, &[".git"]).expect("copy");
        assert!(dst.join("src").join("lua.c").exists());
        assert!(dst.join("Makefile").exists());
        assert!(!dst.join(".git").exists());
        assert_eq!(
            written,
            vec![PathBuf::from("Makefile"), Path::new("src").join("lua.c")]
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn copy_dir_filtered_overwrites_existing_files() {
        let root = scratch("overwrite");
        let src = root.join("src");
        let dst = root.join("dst");
        ensure_dir(&src).expect("src");
        ensure_dir(&dst).expect("dst");
        fs::write(src.join("a.h"), "new").expect("write");
        fs::write(dst.join("a.h"), "old").expect("write");
        copy_dir_filtered(&src, &dst, &[]).expect("copy");
        assert_eq!(fs::read_to_string(dst.join("a.h")).expect("read"), "new");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn remove_dir_if_exists_tolerates_missing_dir() {
        let root = scratch("remove");
        let gone = root.join("never-created");
        remove_dir_if_exists(&gone).expect("missing dir is fine");
        remove_dir_if_exists(&root).expect("remove");
        assert!(!root.exists());
    }
}
