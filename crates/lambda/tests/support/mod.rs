#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use common::{QueuePolicy, WorkerConfig};
use hyper::{Request, Response};
use lambda::{
    DepTracer, FuncStatus, ImportCache, ImportCacheDeps, InstalledPackage, LambdaFunc, LambdaMgr,
    PackagePuller, SubsystemProvider,
};
use sandbox::{Sandbox, SandboxPool, SandboxSpec};

/// Ordered record of subsystem calls, shared by every mock
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

pub struct MockSandbox {
    id: String,
    function: String,
    log: CallLog,
    live: Arc<AtomicUsize>,
    delay: Duration,
    pause_delay: Duration,
    fail_unpause: Arc<AtomicBool>,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    /// Request bodies in the order they reached this sandbox
    pub served: Mutex<Vec<String>>,
    destroyed: AtomicBool,
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn round_trip(&self, request: Request<Bytes>) -> anyhow::Result<Response<Bytes>> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let body = String::from_utf8_lossy(request.body()).to_string();
        self.served.lock().unwrap().push(body.clone());
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if body == "crash" {
            bail!("sandbox {} exited with status 139", self.id);
        }
        Ok(Response::builder()
            .header("x-sandbox", self.id.as_str())
            .body(Bytes::from(body))?)
    }

    async fn pause(&self) -> anyhow::Result<()> {
        tokio::time::sleep(self.pause_delay).await;
        self.log.push(format!("sandbox.pause {}", self.function));
        Ok(())
    }

    async fn unpause(&self) -> anyhow::Result<()> {
        if self.fail_unpause.load(Ordering::SeqCst) {
            self.log.push(format!("sandbox.unpause-failed {}", self.function));
            bail!("cgroup thaw failed");
        }
        self.log.push(format!("sandbox.unpause {}", self.function));
        Ok(())
    }

    async fn destroy(&self, reason: &str) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            self.log
                .push(format!("sandbox.destroy {} ({})", self.function, reason));
        }
    }
}

pub struct MockPool {
    log: CallLog,
    delay: Duration,
    live: Arc<AtomicUsize>,
    fail_creates: AtomicUsize,
    create_delay_ms: AtomicU64,
    pause_delay_ms: AtomicU64,
    fail_unpause: Arc<AtomicBool>,
    pub sandboxes: Mutex<Vec<Arc<MockSandbox>>>,
}

impl MockPool {
    pub fn new(log: CallLog, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            log,
            delay,
            live: Arc::new(AtomicUsize::new(0)),
            fail_creates: AtomicUsize::new(0),
            create_delay_ms: AtomicU64::new(0),
            pause_delay_ms: AtomicU64::new(0),
            fail_unpause: Arc::new(AtomicBool::new(false)),
            sandboxes: Mutex::new(Vec::new()),
        })
    }

    /// Every later create takes `delay` before it resolves
    pub fn set_create_delay(&self, delay: Duration) {
        self.create_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Pauses on sandboxes created from now on take `delay`
    pub fn set_pause_delay(&self, delay: Duration) {
        self.pause_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Every sandbox, existing or future, fails to unpause
    pub fn fail_unpauses(&self, fail: bool) {
        self.fail_unpause.store(fail, Ordering::SeqCst);
    }

    /// The next `n` creates fail
    pub fn fail_next_creates(&self, n: usize) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.sandboxes.lock().unwrap().len()
    }

    pub fn all(&self) -> Vec<Arc<MockSandbox>> {
        self.sandboxes.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxPool for MockPool {
    async fn create(&self, spec: &SandboxSpec) -> anyhow::Result<Arc<dyn Sandbox>> {
        let create_delay = self.create_delay_ms.load(Ordering::SeqCst);
        if create_delay > 0 {
            tokio::time::sleep(Duration::from_millis(create_delay)).await;
        }

        let failing = self
            .fail_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.log.push(format!("pool.create-failed {}", spec.function));
            bail!("out of memory in sandbox pool");
        }

        let mut sandboxes = self.sandboxes.lock().unwrap();
        let sandbox = Arc::new(MockSandbox {
            id: format!("sb-{}", sandboxes.len() + 1),
            function: spec.function.clone(),
            log: self.log.clone(),
            live: Arc::clone(&self.live),
            delay: self.delay,
            pause_delay: Duration::from_millis(self.pause_delay_ms.load(Ordering::SeqCst)),
            fail_unpause: Arc::clone(&self.fail_unpause),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            served: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        });
        sandboxes.push(Arc::clone(&sandbox));
        self.live.fetch_add(1, Ordering::SeqCst);
        self.log.push(format!("pool.create {}", spec.function));
        let sandbox: Arc<dyn Sandbox> = sandbox;
        Ok(sandbox)
    }

    fn debug_string(&self) -> String {
        format!("mock pool: {} live", self.live())
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        self.log.push("pool.cleanup");
        let live = self.live();
        if live > 0 {
            bail!("{} sandboxes still alive", live);
        }
        Ok(())
    }
}

pub struct MockImportCache {
    pool: Arc<dyn SandboxPool>,
    log: CallLog,
}

#[async_trait]
impl ImportCache for MockImportCache {
    async fn create(&self, spec: &SandboxSpec) -> anyhow::Result<Arc<dyn Sandbox>> {
        self.log.push(format!(
            "import_cache.create {} [{}]",
            spec.function,
            spec.package_names().join(",")
        ));
        self.pool.create(spec).await
    }

    async fn cleanup(&self) {
        self.log.push("import_cache.cleanup");
    }
}

pub struct MockPackagePuller {
    log: CallLog,
}

#[async_trait]
impl PackagePuller for MockPackagePuller {
    async fn install(&self, package: &str) -> anyhow::Result<InstalledPackage> {
        self.log.push(format!("package.install {}", package));
        if package == "broken" {
            bail!("no matching distribution for {}", package);
        }
        let deps = match package {
            "requests" => vec!["urllib3".to_string(), "idna".to_string()],
            _ => Vec::new(),
        };
        Ok(InstalledPackage {
            name: package.to_string(),
            path: format!("/packages/{}", package).into(),
            deps,
        })
    }
}

pub struct MockProvider {
    pub pool: Arc<MockPool>,
    pub log: CallLog,
    pub fail_import_cache: bool,
}

#[async_trait]
impl SubsystemProvider for MockProvider {
    async fn sandbox_pool(&self, _config: &WorkerConfig) -> anyhow::Result<Arc<dyn SandboxPool>> {
        let pool: Arc<dyn SandboxPool> = self.pool.clone();
        Ok(pool)
    }

    async fn package_puller(
        &self,
        _config: &WorkerConfig,
        _pool: Arc<dyn SandboxPool>,
        _dep_tracer: Arc<DepTracer>,
    ) -> anyhow::Result<Arc<dyn PackagePuller>> {
        let puller: Arc<dyn PackagePuller> = Arc::new(MockPackagePuller {
            log: self.log.clone(),
        });
        Ok(puller)
    }

    async fn import_cache(
        &self,
        _config: &WorkerConfig,
        deps: ImportCacheDeps,
    ) -> anyhow::Result<Arc<dyn ImportCache>> {
        if self.fail_import_cache {
            bail!("zygote root failed to start");
        }
        let cache: Arc<dyn ImportCache> = Arc::new(MockImportCache {
            pool: deps.pool,
            log: self.log.clone(),
        });
        Ok(cache)
    }
}

/// A worker directory with a registry of ready-made handlers
pub struct Harness {
    pub root: tempfile::TempDir,
    pub config: WorkerConfig,
    pub log: CallLog,
    pub pool: Arc<MockPool>,
}

impl Harness {
    /// `delay` is how long every round trip takes
    pub fn new(delay: Duration) -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let registry = root.path().join("registry");
        std::fs::create_dir_all(&registry).expect("registry dir");
        for name in ["echo", "alpha", "beta", "gamma"] {
            write_handler(&registry, name, None);
        }

        let mut config = WorkerConfig::default();
        config.worker_dir = root.path().join("worker");
        config.registry_dir = registry;
        config.features.import_cache = false;
        config.scheduler.queue_capacity = 256;
        config.scheduler.max_instances = 1;
        config.scheduler.idle_eviction_ms = 0;
        config.scheduler.pause_idle = false;
        config.scheduler.queue_policy = QueuePolicy::Block;

        let log = CallLog::default();
        let pool = MockPool::new(log.clone(), delay);
        Self {
            root,
            config,
            log,
            pool,
        }
    }

    pub fn registry(&self) -> &Path {
        &self.config.registry_dir
    }

    pub fn provider(&self) -> MockProvider {
        MockProvider {
            pool: Arc::clone(&self.pool),
            log: self.log.clone(),
            fail_import_cache: false,
        }
    }

    pub async fn manager(&self) -> LambdaMgr {
        LambdaMgr::new(self.config.clone(), &self.provider())
            .await
            .expect("lambda manager")
    }
}

/// Write `<registry>/<name>/f.py`, plus requirements when given
pub fn write_handler(registry: &Path, name: &str, requirements: Option<&str>) {
    let dir = registry.join(name);
    std::fs::create_dir_all(&dir).expect("handler dir");
    std::fs::write(dir.join("f.py"), "def f(event):\n    return event\n").expect("f.py");
    if let Some(requirements) = requirements {
        std::fs::write(dir.join("requirements.txt"), requirements).expect("requirements");
    }
}

pub fn request(body: impl Into<String>) -> Request<Bytes> {
    Request::builder()
        .method("POST")
        .uri("/run")
        .body(Bytes::from(body.into()))
        .expect("request")
}

/// Poll the function's status until `check` holds
pub async fn wait_for(func: &LambdaFunc, check: impl Fn(&FuncStatus) -> bool) -> FuncStatus {
    for _ in 0..10_000 {
        if let Some(status) = func.status().await {
            if check(&status) {
                return status;
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("function {} never reached the expected state", func.name());
}
