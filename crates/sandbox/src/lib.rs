//! Sandbox contracts consumed by the lambda scheduler.
//!
//! Isolation mechanics (processes, containers, cgroups) live behind these
//! traits; the scheduler only creates, drives, pauses and destroys sandboxes.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use common::config::LimitsConfig;
use hyper::{Request, Response};

/// Resource limits applied to one sandbox
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ResourceLimits {
    pub mem_mb: u64,
    pub procs: u32,
    pub cpu_percent: u32,
    pub max_runtime_secs: u64,
}

impl From<&LimitsConfig> for ResourceLimits {
    fn from(config: &LimitsConfig) -> Self {
        Self {
            mem_mb: config.mem_mb,
            procs: config.procs,
            cpu_percent: config.cpu_percent,
            max_runtime_secs: config.max_runtime_secs,
        }
    }
}

/// An installed package made visible inside a sandbox
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PackageMount {
    pub name: String,
    pub path: PathBuf,
}

/// Everything needed to start a handler sandbox
#[derive(Debug, Clone, serde::Serialize)]
pub struct SandboxSpec {
    pub function: String,
    pub code_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub packages: Vec<PackageMount>,
    pub limits: ResourceLimits,
}

impl SandboxSpec {
    pub fn package_names(&self) -> Vec<String> {
        self.packages.iter().map(|pkg| pkg.name.clone()).collect()
    }
}

/// One isolated execution environment bound to a handler
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    /// Forward one request into the handler and return its response.
    ///
    /// Crashes and timeouts surface as errors.
    async fn round_trip(&self, request: Request<Bytes>) -> anyhow::Result<Response<Bytes>>;

    async fn pause(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn unpause(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release the sandbox's resources. Must be idempotent.
    async fn destroy(&self, reason: &str);
}

/// Creates sandboxes and owns the memory budget they share
#[async_trait]
pub trait SandboxPool: Send + Sync {
    async fn create(&self, spec: &SandboxSpec) -> anyhow::Result<Arc<dyn Sandbox>>;

    /// Human-readable occupancy dump
    fn debug_string(&self) -> String;

    /// Final teardown. Errors when sandboxes are still alive.
    async fn cleanup(&self) -> anyhow::Result<()>;
}
