use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Worker-wide configuration.
///
/// Loaded from TOML and then overridden by `WORKER_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Root for dep traces and the code/scratch storage directories
    pub worker_dir: PathBuf,
    /// Local registry that handler code is pulled from
    pub registry_dir: PathBuf,
    /// Memory budget handed to the sandbox pool (MB)
    pub mem_pool_mb: u64,
    pub features: FeaturesConfig,
    pub limits: LimitsConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    pub import_cache: bool,
}

/// Per-sandbox resource limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub mem_mb: u64,
    pub procs: u32,
    pub cpu_percent: u32,
    pub max_runtime_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            mem_mb: 128,
            procs: 10,
            cpu_percent: 100,
            max_runtime_secs: 30,
        }
    }
}

/// What a producer experiences when a function's inbound queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePolicy {
    /// Wait for queue capacity
    Block,
    /// Fail the invocation immediately
    Reject,
}

impl QueuePolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "block" | "wait" => Some(Self::Block),
            "reject" | "fail" => Some(Self::Reject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Capacity of each function's inbound invocation queue
    pub queue_capacity: usize,
    /// Max live instances per function (0 is treated as 1)
    pub max_instances: usize,
    /// How long an instance may sit idle before it is evicted
    pub idle_eviction_ms: u64,
    /// Pause sandboxes while their instance is idle
    pub pause_idle: bool,
    pub queue_policy: QueuePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_instances: default_max_instances(),
            idle_eviction_ms: 5_000,
            pause_idle: true,
            queue_policy: QueuePolicy::Block,
        }
    }
}

impl SchedulerConfig {
    pub fn instance_limit(&self) -> usize {
        self.max_instances.max(1)
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.max(1)
    }
}

fn default_max_instances() -> usize {
    num_cpus::get().max(1)
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let worker_dir = std::env::temp_dir().join("lambda-worker");
        Self {
            registry_dir: worker_dir.join("registry"),
            worker_dir,
            mem_pool_mb: 1024,
            features: FeaturesConfig::default(),
            limits: LimitsConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Find and parse a config file, then apply environment overrides.
    ///
    /// A missing or broken file is not fatal; defaults are used instead.
    pub fn load() -> Self {
        let env_get = |key: &str| std::env::var(key).ok();
        let mut config = match Self::find_config_path(&env_get) {
            Some(path) => Self::from_path(&path).unwrap_or_else(|err| {
                tracing::warn!("{}", err);
                Self::default()
            }),
            None => Self::default(),
        };
        config.apply_env_with(&env_get);
        config
    }

    pub fn from_path(path: &Path) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| format!("Failed to read {}: {}", path.display(), err))?;
        Self::from_toml(&contents)
            .map_err(|err| format!("Failed to parse {}: {}", path.display(), err))
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Override fields from `WORKER_*` variables.
    ///
    /// Unparseable values are ignored and keep the current setting.
    pub fn apply_env_with<F>(&mut self, env_get: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = env_get("WORKER_DIR") {
            self.worker_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_get("WORKER_REGISTRY_DIR") {
            self.registry_dir = PathBuf::from(dir);
        }
        override_parsed(env_get, "WORKER_MEM_POOL_MB", &mut self.mem_pool_mb);
        if let Some(value) = env_get("WORKER_IMPORT_CACHE") {
            self.features.import_cache = is_truthy(&value);
        }

        override_parsed(env_get, "WORKER_SANDBOX_MEM_MB", &mut self.limits.mem_mb);
        override_parsed(env_get, "WORKER_SANDBOX_PROCS", &mut self.limits.procs);
        override_parsed(env_get, "WORKER_SANDBOX_CPU_PERCENT", &mut self.limits.cpu_percent);
        override_parsed(
            env_get,
            "WORKER_SANDBOX_MAX_RUNTIME_SECS",
            &mut self.limits.max_runtime_secs,
        );

        let scheduler = &mut self.scheduler;
        override_parsed(env_get, "WORKER_QUEUE_CAPACITY", &mut scheduler.queue_capacity);
        override_parsed(env_get, "WORKER_MAX_INSTANCES", &mut scheduler.max_instances);
        override_parsed(env_get, "WORKER_IDLE_EVICTION_MS", &mut scheduler.idle_eviction_ms);
        if let Some(value) = env_get("WORKER_PAUSE_IDLE") {
            scheduler.pause_idle = is_truthy(&value);
        }
        if let Some(policy) = env_get("WORKER_QUEUE_POLICY").and_then(|v| QueuePolicy::parse(&v)) {
            scheduler.queue_policy = policy;
        }
    }

    pub fn dep_trace_path(&self) -> PathBuf {
        self.worker_dir.join("dep-trace.json")
    }

    fn find_config_path<F>(env_get: &F) -> Option<PathBuf>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = env_get("WORKER_CONFIG").map(PathBuf::from) {
            if path.exists() {
                return Some(path);
            }
            tracing::warn!("WORKER_CONFIG set but file not found: {}", path.display());
        }

        let mut candidates = vec![PathBuf::from("worker.toml")];
        if let Some(path) = env_get("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| env_get("HOME").map(|home| PathBuf::from(home).join(".config")))
        {
            candidates.push(path.join("lambda-worker").join("worker.toml"));
        }
        candidates.push(PathBuf::from("/etc/lambda-worker/worker.toml"));

        candidates.into_iter().find(|path| path.exists())
    }
}

fn override_parsed<F, T>(env_get: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(value) = env_get(key).and_then(|s| s.trim().parse().ok()) {
        *slot = value;
    }
}

pub fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_scheduler_expectations() {
        let config = WorkerConfig::default();
        assert_eq!(config.scheduler.queue_capacity, 256);
        assert_eq!(config.scheduler.queue_policy, QueuePolicy::Block);
        assert!(config.scheduler.instance_limit() >= 1);
        assert!(!config.features.import_cache);
    }

    #[test]
    fn toml_sections_are_partial() {
        let config = WorkerConfig::from_toml(
            r#"
            worker_dir = "/var/lib/worker"

            [features]
            import_cache = true

            [scheduler]
            max_instances = 4
            queue_policy = "reject"
            "#,
        )
        .expect("parse");

        assert_eq!(config.worker_dir, PathBuf::from("/var/lib/worker"));
        assert!(config.features.import_cache);
        assert_eq!(config.scheduler.max_instances, 4);
        assert_eq!(config.scheduler.queue_policy, QueuePolicy::Reject);
        assert_eq!(config.scheduler.queue_capacity, 256);
        assert_eq!(config.limits.mem_mb, 128);
    }

    #[test]
    fn env_overrides_win_and_bad_values_are_ignored() {
        let mut config = WorkerConfig::default();
        let env = env_from(&[
            ("WORKER_QUEUE_CAPACITY", "8"),
            ("WORKER_MAX_INSTANCES", "not-a-number"),
            ("WORKER_PAUSE_IDLE", "off"),
            ("WORKER_QUEUE_POLICY", "REJECT"),
            ("WORKER_IMPORT_CACHE", "yes"),
            ("WORKER_DIR", "/tmp/w"),
        ]);
        let max_before = config.scheduler.max_instances;

        config.apply_env_with(&env);

        assert_eq!(config.scheduler.queue_capacity, 8);
        assert_eq!(config.scheduler.max_instances, max_before);
        assert!(!config.scheduler.pause_idle);
        assert_eq!(config.scheduler.queue_policy, QueuePolicy::Reject);
        assert!(config.features.import_cache);
        assert_eq!(config.dep_trace_path(), PathBuf::from("/tmp/w/dep-trace.json"));
    }

    #[test]
    fn zero_limits_are_clamped() {
        let scheduler = SchedulerConfig {
            queue_capacity: 0,
            max_instances: 0,
            ..SchedulerConfig::default()
        };
        assert_eq!(scheduler.instance_limit(), 1);
        assert_eq!(scheduler.queue_capacity(), 1);
    }

    #[test]
    fn from_path_reports_parse_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("worker.toml");
        std::fs::write(&path, "scheduler = 3").expect("write");

        let err = WorkerConfig::from_path(&path).expect_err("should fail");
        assert!(err.starts_with("Failed to parse"));
    }
}
