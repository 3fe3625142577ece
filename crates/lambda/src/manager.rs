//! Registry of function schedulers and owner of the worker's subsystems.
//!
//! Construction order: storage dirs, sandbox pool, dep tracer, package
//! puller, import cache, handler puller. Teardown runs the other way: handler
//! sandboxes (via function kills) before the zygotes they were forked from,
//! zygotes before the pool underneath both.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use common::{DirMaker, Stats, WorkerConfig};
use sandbox::{ResourceLimits, SandboxPool};

use crate::dep_tracer::DepTracer;
use crate::error::LambdaError;
use crate::func::{FuncStatus, LambdaFunc};
use crate::import_cache::{ImportCache, PoolFallback};
use crate::puller::{HandlerPuller, PackagePuller};
use crate::report;

/// Builds the subsystems whose implementation lives outside this crate
#[async_trait]
pub trait SubsystemProvider: Send + Sync {
    async fn sandbox_pool(&self, config: &WorkerConfig) -> anyhow::Result<Arc<dyn SandboxPool>>;

    async fn package_puller(
        &self,
        config: &WorkerConfig,
        pool: Arc<dyn SandboxPool>,
        dep_tracer: Arc<DepTracer>,
    ) -> anyhow::Result<Arc<dyn PackagePuller>>;

    /// Only called when `features.import_cache` is enabled
    async fn import_cache(
        &self,
        config: &WorkerConfig,
        deps: ImportCacheDeps,
    ) -> anyhow::Result<Arc<dyn ImportCache>>;
}

/// What an import cache is built on
pub struct ImportCacheDeps {
    pub code_dirs: Arc<DirMaker>,
    pub scratch_dirs: Arc<DirMaker>,
    pub pool: Arc<dyn SandboxPool>,
    pub package_puller: Arc<dyn PackagePuller>,
}

/// Shared by every function's scheduler; each member arbitrates its own locking
pub(crate) struct Subsystems {
    pub(crate) sandbox_pool: Arc<dyn SandboxPool>,
    pub(crate) dep_tracer: Arc<DepTracer>,
    pub(crate) package_puller: Arc<dyn PackagePuller>,
    pub(crate) import_cache: Arc<dyn ImportCache>,
    pub(crate) handler_puller: Arc<HandlerPuller>,
    pub(crate) code_dirs: Arc<DirMaker>,
    pub(crate) scratch_dirs: Arc<DirMaker>,
    pub(crate) limits: ResourceLimits,
    pub(crate) stats: Arc<Stats>,
}

/// Whatever has been built so far, torn down in dependency order
#[derive(Default)]
struct Teardown {
    code_dirs: Option<Arc<DirMaker>>,
    scratch_dirs: Option<Arc<DirMaker>>,
    sandbox_pool: Option<Arc<dyn SandboxPool>>,
    dep_tracer: Option<Arc<DepTracer>>,
    import_cache: Option<Arc<dyn ImportCache>>,
}

impl Teardown {
    fn from_subsystems(subsystems: &Subsystems) -> Self {
        Self {
            code_dirs: Some(Arc::clone(&subsystems.code_dirs)),
            scratch_dirs: Some(Arc::clone(&subsystems.scratch_dirs)),
            sandbox_pool: Some(Arc::clone(&subsystems.sandbox_pool)),
            dep_tracer: Some(Arc::clone(&subsystems.dep_tracer)),
            import_cache: Some(Arc::clone(&subsystems.import_cache)),
        }
    }

    /// Runs after every handler sandbox is gone
    async fn run(self) {
        // HandlerPuller and PackagePuller need no cleanup

        if let Some(import_cache) = self.import_cache {
            if import_cache.enabled() {
                tracing::info!("Cleaning up ImportCache");
            }
            import_cache.cleanup().await;
        }

        if let Some(pool) = self.sandbox_pool {
            tracing::info!("Cleaning up SandboxPool");
            if let Err(err) = pool.cleanup().await {
                tracing::error!(
                    "SandboxPool cleanup found live sandboxes, teardown order was violated: {:#}",
                    err
                );
            }
        }

        if let Some(dep_tracer) = self.dep_tracer {
            dep_tracer.cleanup();
        }
        if let Some(code_dirs) = self.code_dirs {
            code_dirs.cleanup();
        }
        if let Some(scratch_dirs) = self.scratch_dirs {
            scratch_dirs.cleanup();
        }
    }
}

#[derive(Default)]
struct Registry {
    funcs: HashMap<String, Arc<LambdaFunc>>,
    closed: bool,
}

/// Thread-safe lookup of function schedulers plus all lambda subsystems
pub struct LambdaMgr {
    config: WorkerConfig,
    subsystems: Arc<Subsystems>,
    registry: Mutex<Registry>,
}

impl LambdaMgr {
    /// Build every subsystem. On failure, whatever was already built is torn
    /// down before the error is returned.
    pub async fn new(
        config: WorkerConfig,
        provider: &dyn SubsystemProvider,
    ) -> Result<Self, LambdaError> {
        let mut built = Teardown::default();
        match Self::build(&config, provider, &mut built).await {
            Ok(subsystems) => Ok(Self {
                config,
                subsystems: Arc::new(subsystems),
                registry: Mutex::new(Registry::default()),
            }),
            Err(err) => {
                tracing::warn!("Cleanup Lambda Manager due to error: {}", err);
                built.run().await;
                Err(err)
            }
        }
    }

    async fn build(
        config: &WorkerConfig,
        provider: &dyn SubsystemProvider,
        built: &mut Teardown,
    ) -> Result<Subsystems, LambdaError> {
        let code_dirs = Arc::new(
            DirMaker::new(&config.worker_dir, "code")
                .map_err(|err| LambdaError::subsystem("code dirs", err))?,
        );
        built.code_dirs = Some(Arc::clone(&code_dirs));
        let scratch_dirs = Arc::new(
            DirMaker::new(&config.worker_dir, "scratch")
                .map_err(|err| LambdaError::subsystem("scratch dirs", err))?,
        );
        built.scratch_dirs = Some(Arc::clone(&scratch_dirs));

        tracing::info!("Creating SandboxPool");
        let sandbox_pool = provider
            .sandbox_pool(config)
            .await
            .map_err(|err| LambdaError::subsystem("SandboxPool", err))?;
        built.sandbox_pool = Some(Arc::clone(&sandbox_pool));

        tracing::info!("Creating DepTracer");
        let dep_tracer = Arc::new(
            DepTracer::new(&config.dep_trace_path())
                .map_err(|err| LambdaError::subsystem("DepTracer", err))?,
        );
        built.dep_tracer = Some(Arc::clone(&dep_tracer));

        tracing::info!("Creating PackagePuller");
        let package_puller = provider
            .package_puller(config, Arc::clone(&sandbox_pool), Arc::clone(&dep_tracer))
            .await
            .map_err(|err| LambdaError::subsystem("PackagePuller", err))?;

        let import_cache: Arc<dyn ImportCache> = if config.features.import_cache {
            tracing::info!("Creating ImportCache");
            let deps = ImportCacheDeps {
                code_dirs: Arc::clone(&code_dirs),
                scratch_dirs: Arc::clone(&scratch_dirs),
                pool: Arc::clone(&sandbox_pool),
                package_puller: Arc::clone(&package_puller),
            };
            provider
                .import_cache(config, deps)
                .await
                .map_err(|err| LambdaError::subsystem("ImportCache", err))?
        } else {
            Arc::new(PoolFallback::new(Arc::clone(&sandbox_pool)))
        };
        built.import_cache = Some(Arc::clone(&import_cache));

        tracing::info!("Creating HandlerPuller");
        let handler_puller = Arc::new(HandlerPuller::new(
            config.registry_dir.clone(),
            Arc::clone(&code_dirs),
        ));

        Ok(Subsystems {
            sandbox_pool,
            dep_tracer,
            package_puller,
            import_cache,
            handler_puller,
            code_dirs,
            scratch_dirs,
            limits: ResourceLimits::from(&config.limits),
            stats: Stats::new(),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// The function's scheduler, started on first use.
    ///
    /// Must be called within a tokio runtime.
    pub fn get(&self, name: &str) -> Result<Arc<LambdaFunc>, LambdaError> {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if registry.closed {
            return Err(LambdaError::ManagerClosed);
        }

        let func = registry.funcs.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!("starting scheduler for function {}", name);
            LambdaFunc::spawn(
                name,
                Arc::clone(&self.subsystems),
                self.config.scheduler.clone(),
            )
        });
        Ok(Arc::clone(func))
    }

    pub fn function_names(&self) -> Vec<String> {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = registry.funcs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Status of every live function, in name order
    pub async fn status(&self) -> Vec<FuncStatus> {
        let funcs: Vec<Arc<LambdaFunc>> = {
            let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry.funcs.values().cloned().collect()
        };
        let mut statuses = Vec::with_capacity(funcs.len());
        for func in funcs {
            if let Some(status) = func.status().await {
                statuses.push(status);
            }
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Sandbox pool occupancy
    pub fn debug(&self) -> String {
        format!("{}\n", self.subsystems.sandbox_pool.debug_string())
    }

    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "functions": self.function_names(),
            "import_cache": self.subsystems.import_cache.enabled(),
            "stats": self.subsystems.stats.to_json(),
        })
    }

    pub fn profile_report(&self) -> Vec<String> {
        report::profile_lines(&self.subsystems.stats.snapshot())
    }

    pub fn dump_stats_to_log(&self) {
        for line in self.profile_report() {
            tracing::info!("{}", line);
        }
    }

    /// Shut the worker down. The manager is unusable afterwards: `get`
    /// fails and repeated cleanups return immediately.
    pub async fn cleanup(&self) {
        let funcs = {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            if registry.closed {
                tracing::warn!("Lambda Manager already cleaned up");
                return;
            }
            registry.closed = true;
            std::mem::take(&mut registry.funcs)
        };

        self.dump_stats_to_log();

        let mut funcs: Vec<(String, Arc<LambdaFunc>)> = funcs.into_iter().collect();
        funcs.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, func) in funcs {
            tracing::info!("Kill function: {}", name);
            func.kill().await;
        }

        Teardown::from_subsystems(&self.subsystems).run().await;
    }
}
