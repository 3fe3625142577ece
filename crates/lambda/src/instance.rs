//! One sandbox bound to one function, plus the work done on its behalf
//! outside the scheduling loop: cold-start provisioning and serving a request.

use std::sync::Arc;

use sandbox::{PackageMount, Sandbox, SandboxSpec};
use tokio::time::Instant;

use crate::error::LambdaError;
use crate::invocation::Invocation;
use crate::manager::Subsystems;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Sandbox is being provisioned
    Starting,
    /// Serving exactly one invocation
    Busy,
    /// Sandbox pause in flight
    Pausing,
    Idle,
}

/// Scheduler-side record of an instance. Only the owning loop mutates it.
pub(crate) struct LambdaInstance {
    pub(crate) id: u64,
    pub(crate) sandbox: Option<Arc<dyn Sandbox>>,
    pub(crate) state: InstanceState,
    pub(crate) paused: bool,
    /// Bumped on every transition into and out of idle; stale eviction checks carry an old epoch
    pub(crate) epoch: u64,
    pub(crate) served: u64,
}

impl LambdaInstance {
    pub(crate) fn starting(id: u64) -> Self {
        Self {
            id,
            sandbox: None,
            state: InstanceState::Starting,
            paused: false,
            epoch: 0,
            served: 0,
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.sandbox.is_some()
    }

    pub(crate) fn in_flight(&self) -> bool {
        matches!(
            self.state,
            InstanceState::Starting | InstanceState::Busy | InstanceState::Pausing
        )
    }
}

/// Messages from instance work back to the scheduling loop
pub(crate) enum InstanceEvent {
    Provisioned {
        id: u64,
        result: Result<Arc<dyn Sandbox>, LambdaError>,
    },
    Finished {
        id: u64,
        /// Set when the sandbox faulted; the instance must not be reused
        fault: Option<String>,
    },
    Paused {
        id: u64,
        result: anyhow::Result<()>,
    },
}

/// Cold path: pull the handler, install its packages and create a sandbox
pub(crate) async fn provision(
    function: &str,
    subsystems: &Subsystems,
) -> Result<Arc<dyn Sandbox>, LambdaError> {
    let _wait = subsystems.stats.timer("LambdaInstance-WaitSandbox");
    let fail = |err: anyhow::Error| LambdaError::provisioning(function, err);

    let handler = subsystems.handler_puller.pull(function).await.map_err(fail)?;

    let mut packages = Vec::with_capacity(handler.packages.len());
    for package in &handler.packages {
        let installed = subsystems
            .package_puller
            .install(package)
            .await
            .map_err(|err| fail(err.context(format!("install {}", package))))?;
        subsystems
            .dep_tracer
            .record_package(&installed.name, &installed.deps);
        packages.push(PackageMount {
            name: installed.name,
            path: installed.path,
        });
    }
    subsystems
        .dep_tracer
        .record_function(function, &handler.packages);

    let scratch_dir = subsystems
        .scratch_dirs
        .make(function)
        .map_err(|err| fail(anyhow::Error::new(err).context("allocate scratch dir")))?;

    let spec = SandboxSpec {
        function: function.to_string(),
        code_dir: handler.code_dir,
        scratch_dir,
        packages,
        limits: subsystems.limits.clone(),
    };

    let cache = &subsystems.import_cache;
    let _create = subsystems.stats.timer(cache.timer_name());
    cache.create(&spec).await.map_err(fail)
}

/// Serve one invocation on `sandbox`.
///
/// Fires the invocation's completion and returns the fault, if the sandbox
/// produced one.
pub(crate) async fn serve(
    function: &str,
    sandbox: Arc<dyn Sandbox>,
    mut invocation: Invocation,
    unpause: bool,
    subsystems: &Subsystems,
) -> Option<String> {
    let stats = &subsystems.stats;
    let request = invocation.begin_execution();

    if unpause {
        let _wait = stats.timer("LambdaInstance-WaitSandbox");
        let _unpause = stats.timer("LambdaInstance-WaitSandbox-Unpause");
        if let Err(err) = sandbox.unpause().await {
            let reason = format!("unpause {}: {:#}", sandbox.id(), err);
            invocation.fail(LambdaError::execution(function, &reason), stats);
            return Some(reason);
        }
    }

    let _serve = stats.timer("LambdaInstance-ServeRequests");

    let round_trip = stats.timer("LambdaInstance-RoundTrip");
    let started = Instant::now();
    let result = sandbox.round_trip(request).await;
    invocation.set_exec_ms(started.elapsed().as_millis() as u64);
    round_trip.stop();

    match result {
        Ok(response) => {
            invocation.complete(response, stats);
            None
        }
        Err(err) => {
            let reason = format!("{:#}", err);
            invocation.fail(LambdaError::execution(function, &reason), stats);
            Some(reason)
        }
    }
}
