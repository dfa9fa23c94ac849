use anyhow::{bail, Context, Result};
use bench_core::config::TOOLCHAIN_NAME;
use bench_core::{ensure_dir, BenchConfig, BenchError, VariantIdentity};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const LUA_FTP_URL: &str = "https://www.lua.org/ftp";
pub const W64DEVKIT_URL: &str =
    "https://github.com/skeeto/w64devkit/releases/download/v1.21.0/w64devkit-1.21.0.zip";

/// Makes third-party archives available locally.
pub trait Provisioner: Send + Sync {
    /// Idempotent: a no-op when `name` is already present.
    fn ensure_available(&self, name: &str) -> Result<()>;
}

/// Fetches PUC-Lua source releases and the toolchain over HTTP.
pub struct ArchiveProvisioner {
    config: Arc<BenchConfig>,
}

impl ArchiveProvisioner {
    pub fn new(config: Arc<BenchConfig>) -> Self {
        Self { config }
    }

    fn ensure_toolchain(&self) -> Result<()> {
        if self.config.toolchain_dir.exists() {
            debug!("{} already downloaded, skipping.", TOOLCHAIN_NAME);
            return Ok(());
        }
        if !self.config.downloads_allowed {
            return Err(BenchError::DownloadDisabled(TOOLCHAIN_NAME.to_string()).into());
        }
        let archive = self.config.temp_dir().join("w64devkit.zip");
        info!("Downloading {} from {}.", TOOLCHAIN_NAME, W64DEVKIT_URL);
        download(W64DEVKIT_URL, &archive)?;
        let extracted = extract_zip(&archive, &self.config.tools_dir());
        let _ = fs::remove_file(&archive);
        extracted
    }

    fn ensure_lua_source(&self, release: &str) -> Result<()> {
        let vendored = self.config.interpreters_code_dir().join(release);
        let downloaded = self.config.interpreters_dir().join(release);
        if vendored.exists() || downloaded.exists() {
            debug!("{} already downloaded, skipping.", release);
            return Ok(());
        }
        if !self.config.downloads_allowed {
            return Err(BenchError::DownloadDisabled(release.to_string()).into());
        }
        let url = format!("{}/{}.tar.gz", LUA_FTP_URL, release);
        let archive = self.config.temp_dir().join(format!("{}.tar.gz", release));
        info!("Downloading {} from {}.", release, url);
        download(&url, &archive)?;
        let extracted = extract_tar_gz(&archive, &self.config.interpreters_dir());
        let _ = fs::remove_file(&archive);
        extracted?;
        if !downloaded.exists() {
            bail!(
                "archive for {} did not contain a top-level '{}' directory",
                release,
                release
            );
        }
        Ok(())
    }
}

impl Provisioner for ArchiveProvisioner {
    fn ensure_available(&self, name: &str) -> Result<()> {
        if name == TOOLCHAIN_NAME {
            return self.ensure_toolchain();
        }
        match VariantIdentity::from_release(name) {
            Some(variant) if variant.family().is_downloadable() => self.ensure_lua_source(name),
            _ => {
                let source = self.config.pristine_source(name);
                if source.exists() {
                    Ok(())
                } else {
                    Err(BenchError::SourceMissing {
                        release: name.to_string(),
                        searched: self.config.interpreters_code_dir(),
                    }
                    .into())
                }
            }
        }
    }
}

fn download(url: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        ensure_dir(parent)?;
    }
    let client = reqwest::blocking::Client::builder()
        .build()
        .context("build http client")?;
    let mut resp = client
        .get(url)
        .send()
        .with_context(|| format!("GET {}", url))?;
    if !resp.status().is_success() {
        return Err(BenchError::DownloadFailed {
            url: url.to_string(),
            status: resp.status().as_u16(),
        }
        .into());
    }
    let tmp = dest.with_extension("download.tmp");
    let mut file = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
    resp.copy_to(&mut file)
        .with_context(|| format!("write {}", tmp.display()))?;
    drop(file);
    fs::rename(&tmp, dest)
        .with_context(|| format!("rename {} -> {}", tmp.display(), dest.display()))?;
    Ok(())
}

fn extract_tar_gz(path: &Path, out_dir: &Path) -> Result<()> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut ar = tar::Archive::new(GzDecoder::new(f));
    for entry in ar.entries().context("read tar entries")? {
        let mut entry = entry?;
        let entry_path = entry.path()?.to_path_buf();
        let out_path = out_dir.join(sanitize_rel_path(&entry_path)?);
        if let Some(parent) = out_path.parent() {
            ensure_dir(parent)?;
        }
        entry
            .unpack(&out_path)
            .with_context(|| format!("unpack {}", out_path.display()))?;
    }
    Ok(())
}

fn extract_zip(path: &Path, out_dir: &Path) -> Result<()> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut z = zip::ZipArchive::new(f).context("open zip")?;
    for i in 0..z.len() {
        let mut file = z.by_index(i).context("zip entry")?;
        let name = file.name().to_string();
        let out_path = out_dir.join(sanitize_rel_path(Path::new(&name))?);
        if file.is_dir() {
            ensure_dir(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            ensure_dir(parent)?;
        }
        let mut out =
            File::create(&out_path).with_context(|| format!("create {}", out_path.display()))?;
        std::io::copy(&mut file, &mut out)
            .with_context(|| format!("write {}", out_path.display()))?;
    }
    Ok(())
}

fn sanitize_rel_path(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Prefix(_) | Component::RootDir => {
                bail!("invalid archive path (absolute): {}", path.display())
            }
            Component::ParentDir => bail!("invalid archive path (..): {}", path.display()),
            Component::CurDir => {}
            Component::Normal(p) => out.push(p),
        }
    }
    Ok(out)
}
