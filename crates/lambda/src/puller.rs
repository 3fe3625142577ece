//! Getting handler code and packages onto local storage before a cold start.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use anyhow::{Context, bail};
use async_trait::async_trait;
use common::DirMaker;

const REQUIREMENTS_FILE: &str = "requirements.txt";

/// Handler code materialized in a private code directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerCode {
    pub function: String,
    pub code_dir: PathBuf,
    /// Packages named in the handler's requirements, in file order
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub name: String,
    pub path: PathBuf,
    pub deps: Vec<String>,
}

/// Installs packages (and their dependencies) onto local storage
#[async_trait]
pub trait PackagePuller: Send + Sync {
    async fn install(&self, package: &str) -> anyhow::Result<InstalledPackage>;
}

struct CachedHandler {
    modified: SystemTime,
    code: HandlerCode,
}

/// Pulls handlers from a local registry directory.
///
/// A function `name` is either a directory `<registry>/<name>/` or a single
/// file `<registry>/<name>.py`. Pulls are cached until the entry changes.
pub struct HandlerPuller {
    registry_dir: PathBuf,
    code_dirs: Arc<DirMaker>,
    cache: Mutex<HashMap<String, CachedHandler>>,
}

impl HandlerPuller {
    pub fn new(registry_dir: PathBuf, code_dirs: Arc<DirMaker>) -> Self {
        Self {
            registry_dir,
            code_dirs,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn pull(&self, name: &str) -> anyhow::Result<HandlerCode> {
        validate_name(name)?;
        let source = self.resolve(name)?;
        let modified = latest_mtime(&source)?;

        if let Some(code) = self.cached(name, modified) {
            tracing::debug!("handler {} unchanged, reusing {}", name, code.code_dir.display());
            return Ok(code);
        }

        let code_dirs = Arc::clone(&self.code_dirs);
        let function = name.to_string();
        let code = tokio::task::spawn_blocking(move || {
            install_handler(&code_dirs, &function, &source)
        })
        .await
        .context("handler pull task")??;

        tracing::debug!("pulled handler {} into {}", name, code.code_dir.display());
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.insert(
            name.to_string(),
            CachedHandler {
                modified,
                code: code.clone(),
            },
        );
        Ok(code)
    }

    fn resolve(&self, name: &str) -> anyhow::Result<PathBuf> {
        let dir = self.registry_dir.join(name);
        if dir.is_dir() {
            return Ok(dir);
        }
        let file = self.registry_dir.join(format!("{}.py", name));
        if file.is_file() {
            return Ok(file);
        }
        bail!(
            "function {} not found in registry {}",
            name,
            self.registry_dir.display()
        )
    }

    fn cached(&self, name: &str, modified: SystemTime) -> Option<HandlerCode> {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache
            .get(name)
            .filter(|entry| entry.modified == modified && entry.code.code_dir.exists())
            .map(|entry| entry.code.clone())
    }
}

fn validate_name(name: &str) -> anyhow::Result<()> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
        bail!("invalid function name {:?}", name);
    }
    Ok(())
}

fn install_handler(
    code_dirs: &DirMaker,
    function: &str,
    source: &Path,
) -> anyhow::Result<HandlerCode> {
    let code_dir = code_dirs
        .make(function)
        .with_context(|| format!("allocate code dir for {}", function))?;

    if source.is_dir() {
        copy_tree(source, &code_dir)?;
    } else {
        std::fs::copy(source, code_dir.join("f.py"))
            .with_context(|| format!("copy {}", source.display()))?;
    }

    let requirements = code_dir.join(REQUIREMENTS_FILE);
    let packages = if requirements.is_file() {
        let contents = std::fs::read_to_string(&requirements)
            .with_context(|| format!("read {}", requirements.display()))?;
        parse_requirements(&contents)
    } else {
        Vec::new()
    };

    Ok(HandlerCode {
        function: function.to_string(),
        code_dir,
        packages,
    })
}

fn copy_tree(from: &Path, to: &Path) -> anyhow::Result<()> {
    for entry in std::fs::read_dir(from).with_context(|| format!("read {}", from.display()))? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            std::fs::create_dir_all(&target)?;
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}

fn latest_mtime(path: &Path) -> anyhow::Result<SystemTime> {
    let meta = std::fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    let mut latest = meta.modified()?;
    if meta.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let modified = latest_mtime(&entry?.path())?;
            if modified > latest {
                latest = modified;
            }
        }
    }
    Ok(latest)
}

/// Package names from a requirements file; pins, extras and markers are dropped
pub fn parse_requirements(contents: &str) -> Vec<String> {
    let mut packages: Vec<String> = Vec::new();
    for line in contents.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() || line.starts_with('-') {
            continue;
        }
        let name = line
            .split(|ch: char| "=<>!~;[ ".contains(ch))
            .next()
            .unwrap_or("")
            .trim()
            .to_lowercase();
        if !name.is_empty() && !packages.contains(&name) {
            packages.push(name);
        }
    }
    packages
}
