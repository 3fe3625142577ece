use std::sync::Arc;

use async_trait::async_trait;
use sandbox::{Sandbox, SandboxPool, SandboxSpec};

/// Source of handler sandboxes for cold starts.
///
/// A real import cache keeps zygote sandboxes with common packages already
/// imported and forks handler sandboxes from them. When the feature is off the
/// scheduler talks to [`PoolFallback`] instead, so cold starts follow one path.
#[async_trait]
pub trait ImportCache: Send + Sync {
    /// Stats timer the creation is recorded under
    fn timer_name(&self) -> &'static str {
        "ImportCache.Create"
    }

    fn enabled(&self) -> bool {
        true
    }

    /// Produce a sandbox with `spec.packages` importable
    async fn create(&self, spec: &SandboxSpec) -> anyhow::Result<Arc<dyn Sandbox>>;

    /// Destroy every zygote. Called after all handler sandboxes are gone.
    async fn cleanup(&self);
}

/// Disabled import cache: every sandbox comes straight from the pool
pub struct PoolFallback {
    pool: Arc<dyn SandboxPool>,
}

impl PoolFallback {
    pub fn new(pool: Arc<dyn SandboxPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ImportCache for PoolFallback {
    fn timer_name(&self) -> &'static str {
        "LambdaInstance-WaitSandbox-NoImportCache"
    }

    fn enabled(&self) -> bool {
        false
    }

    async fn create(&self, spec: &SandboxSpec) -> anyhow::Result<Arc<dyn Sandbox>> {
        self.pool.create(spec).await
    }

    async fn cleanup(&self) {}
}
