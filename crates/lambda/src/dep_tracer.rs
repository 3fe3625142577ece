//! Append-only trace of which packages each function and package pulls in.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::Context;

pub struct DepTracer {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl DepTracer {
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the package set a function was started with
    pub fn record_function(&self, function: &str, packages: &[String]) {
        self.write(serde_json::json!({
            "type": "function",
            "name": function,
            "packages": packages,
            "ts": chrono::Utc::now().to_rfc3339(),
        }));
    }

    /// Record the direct dependencies of an installed package
    pub fn record_package(&self, package: &str, deps: &[String]) {
        self.write(serde_json::json!({
            "type": "package",
            "name": package,
            "deps": deps,
            "ts": chrono::Utc::now().to_rfc3339(),
        }));
    }

    /// Flush and close; later records are dropped
    pub fn cleanup(&self) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut out) = writer.take() {
            if let Err(err) = out.flush() {
                tracing::warn!("failed to flush {}: {}", self.path.display(), err);
            }
        }
    }

    fn write(&self, event: serde_json::Value) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(out) = writer.as_mut() else {
            tracing::debug!("dep trace closed, dropping event");
            return;
        };
        let result = serde_json::to_writer(&mut *out, &event)
            .map_err(std::io::Error::from)
            .and_then(|()| out.write_all(b"\n"))
            .and_then(|()| out.flush());
        if let Err(err) = result {
            tracing::warn!("failed to write {}: {}", self.path.display(), err);
        }
    }
}
