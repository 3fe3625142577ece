//! Per-function scheduling actor.
//!
//! Every registered function gets one `FuncTask` running on its own tokio
//! task. The task exclusively owns the function's instances and backlog; the
//! rest of the worker talks to it through bounded/unbounded channels:
//!
//! - invocations: bounded inbound queue (backpressure for producers)
//! - instance events: provisioning results, finished requests, pauses
//! - eviction checks: delayed idle-eviction ticks
//! - control: status queries
//! - kill: terminal shutdown, acknowledged on a oneshot
//!
//! Sandbox work (provisioning, round trips, pauses, destroys) runs on
//! separate tasks so a slow sandbox never stalls dispatch.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{QueuePolicy, SchedulerConfig};
use hyper::Request;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use crate::error::LambdaError;
use crate::instance::{self, InstanceEvent, InstanceState, LambdaInstance};
use crate::invocation::{Completion, Invocation};
use crate::manager::Subsystems;

/// Snapshot of one function's scheduler state
#[derive(Debug, Clone, serde::Serialize)]
pub struct FuncStatus {
    pub name: String,
    /// No warm instance exists; the next invocation pays a cold start
    pub cold_path: bool,
    /// Invocations accepted by the scheduler but not yet dispatched
    pub backlog: usize,
    /// Invocations still sitting in the inbound queue
    pub queued: usize,
    pub instances: Vec<InstanceStatus>,
}

impl FuncStatus {
    pub fn count(&self, state: InstanceState) -> usize {
        self.instances.iter().filter(|i| i.state == state).count()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct InstanceStatus {
    pub id: u64,
    pub sandbox_id: Option<String>,
    pub state: InstanceState,
    pub paused: bool,
    pub served: u64,
}

enum FuncControl {
    Status {
        response_tx: oneshot::Sender<FuncStatus>,
    },
}

struct EvictionCheck {
    id: u64,
    epoch: u64,
}

/// Handle to a function's scheduling task
pub struct LambdaFunc {
    name: String,
    invoke_tx: mpsc::Sender<Invocation>,
    control_tx: mpsc::UnboundedSender<FuncControl>,
    kill_tx: mpsc::Sender<oneshot::Sender<()>>,
    queue_policy: QueuePolicy,
    subsystems: Arc<Subsystems>,
}

impl LambdaFunc {
    /// Create the handle and start the scheduling task
    pub(crate) fn spawn(
        name: &str,
        subsystems: Arc<Subsystems>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let (invoke_tx, invoke_rx) = mpsc::channel(config.queue_capacity());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = mpsc::channel(1);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (delay_tx, delay_rx) = mpsc::unbounded_channel();

        let func = Arc::new(Self {
            name: name.to_string(),
            invoke_tx,
            control_tx,
            kill_tx,
            queue_policy: config.queue_policy,
            subsystems: Arc::clone(&subsystems),
        });

        let task = FuncTask {
            name: name.to_string(),
            subsystems,
            config,
            invoke_rx,
            control_rx,
            kill_rx,
            events_tx,
            events_rx,
            delay_tx,
            delay_rx,
            instances: Vec::new(),
            backlog: VecDeque::new(),
            cold_path: true,
            next_instance_id: 1,
            teardown: JoinSet::new(),
        };
        tokio::spawn(task.run());

        func
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue an invocation for this function.
    ///
    /// Under `QueuePolicy::Block` this waits for queue capacity. If the
    /// invocation cannot be queued its completion fires with the error
    /// returned here.
    pub async fn submit(&self, invocation: Invocation) -> Result<(), LambdaError> {
        let rejected = match self.queue_policy {
            QueuePolicy::Block => match self.invoke_tx.send(invocation).await {
                Ok(()) => return Ok(()),
                Err(SendError(invocation)) => (invocation, self.killed()),
            },
            QueuePolicy::Reject => match self.invoke_tx.try_send(invocation) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(invocation)) => (
                    invocation,
                    LambdaError::QueueFull {
                        function: self.name.clone(),
                    },
                ),
                Err(TrySendError::Closed(invocation)) => (invocation, self.killed()),
            },
        };

        let (invocation, err) = rejected;
        invocation.fail(err.clone(), &self.subsystems.stats);
        Err(err)
    }

    /// Submit a request and wait for it to complete
    pub async fn invoke(&self, request: Request<Bytes>) -> Completion {
        let (invocation, handle) = Invocation::new(request);
        // Rejections still fire the completion, so the handle always resolves
        let _ = self.submit(invocation).await;
        handle.wait().await
    }

    /// Scheduler state as seen by the scheduling task; `None` once killed
    pub async fn status(&self) -> Option<FuncStatus> {
        let (response_tx, response_rx) = oneshot::channel();
        self.control_tx
            .send(FuncControl::Status { response_tx })
            .ok()?;
        response_rx.await.ok()
    }

    pub fn is_killed(&self) -> bool {
        self.invoke_tx.is_closed()
    }

    /// Stop the function and wait until every instance is gone.
    ///
    /// Queued invocations fail with `FunctionKilled`; in-flight ones finish first.
    pub async fn kill(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.kill_tx.send(ack_tx).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }

    fn killed(&self) -> LambdaError {
        LambdaError::FunctionKilled {
            function: self.name.clone(),
        }
    }
}

impl std::fmt::Debug for LambdaFunc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LambdaFunc")
            .field("name", &self.name)
            .field("queue_policy", &self.queue_policy)
            .field("killed", &self.is_killed())
            .finish()
    }
}

struct FuncTask {
    name: String,
    subsystems: Arc<Subsystems>,
    config: SchedulerConfig,
    invoke_rx: mpsc::Receiver<Invocation>,
    control_rx: mpsc::UnboundedReceiver<FuncControl>,
    kill_rx: mpsc::Receiver<oneshot::Sender<()>>,
    events_tx: mpsc::UnboundedSender<InstanceEvent>,
    events_rx: mpsc::UnboundedReceiver<InstanceEvent>,
    delay_tx: mpsc::UnboundedSender<EvictionCheck>,
    delay_rx: mpsc::UnboundedReceiver<EvictionCheck>,
    /// Live instances in creation order
    instances: Vec<LambdaInstance>,
    /// Accepted invocations waiting for a starting or pausing instance, FIFO
    backlog: VecDeque<Invocation>,
    cold_path: bool,
    next_instance_id: u64,
    /// Sandbox destroys in flight
    teardown: JoinSet<()>,
}

impl FuncTask {
    async fn run(mut self) {
        tracing::debug!("function {} scheduler started", self.name);

        let kill_ack = loop {
            let accepting = self.can_accept();
            tokio::select! {
                biased;
                // A closed kill channel means every handle is gone
                ack = self.kill_rx.recv() => break ack,
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                Some(check) = self.delay_rx.recv() => self.handle_eviction_check(check),
                Some(cmd) = self.control_rx.recv() => self.handle_control(cmd),
                Some(invocation) = self.invoke_rx.recv(), if accepting => {
                    self.handle_invocation(invocation)
                }
                Some(result) = self.teardown.join_next(), if !self.teardown.is_empty() => {
                    if let Err(err) = result {
                        tracing::error!(
                            "function {}: sandbox destroy task failed: {}",
                            self.name,
                            err
                        );
                    }
                }
            }
        };

        self.shutdown(kill_ack).await;
    }

    fn handle_invocation(&mut self, invocation: Invocation) {
        if self.backlog.is_empty() {
            if let Some(idx) = self.idle_instance() {
                self.dispatch(idx, invocation);
                return;
            }
        }
        self.backlog.push_back(invocation);
        self.scale_up();
    }

    fn handle_event(&mut self, event: InstanceEvent) {
        match event {
            InstanceEvent::Provisioned { id, result } => {
                let Some(idx) = self.position(id) else { return };
                match result {
                    Ok(sandbox) => {
                        tracing::debug!(
                            "function {}: instance {} ready (sandbox {})",
                            self.name,
                            id,
                            sandbox.id()
                        );
                        self.instances[idx].sandbox = Some(sandbox);
                        self.cold_path = false;
                        self.release(idx);
                    }
                    Err(err) => {
                        tracing::warn!("{}", err);
                        self.instances.remove(idx);
                        self.refresh_cold_path();
                        // Each failed launch consumes exactly one waiting invocation, the
                        // oldest, even if another starting instance could have served it.
                        if let Some(invocation) = self.backlog.pop_front() {
                            invocation.fail(err, &self.subsystems.stats);
                        }
                        self.scale_up();
                    }
                }
            }
            InstanceEvent::Finished { id, fault } => {
                let Some(idx) = self.position(id) else { return };
                match fault {
                    None => self.release(idx),
                    Some(reason) => {
                        tracing::warn!(
                            "function {}: evicting faulted instance {}: {}",
                            self.name,
                            id,
                            reason
                        );
                        self.evict(idx, "execution fault");
                        self.scale_up();
                    }
                }
            }
            InstanceEvent::Paused { id, result } => {
                let Some(idx) = self.position(id) else { return };
                match result {
                    Ok(()) => {
                        self.instances[idx].paused = true;
                        self.release(idx);
                    }
                    Err(err) => {
                        tracing::warn!(
                            "function {}: pause failed on instance {}: {:#}",
                            self.name,
                            id,
                            err
                        );
                        self.evict(idx, "pause failed");
                        self.scale_up();
                    }
                }
            }
        }
    }

    /// An instance has no work: hand it the next queued invocation, or park it
    fn release(&mut self, idx: usize) {
        if let Some(invocation) = self.next_queued() {
            self.dispatch(idx, invocation);
            return;
        }

        let pause_idle = self.config.pause_idle;
        let instance = &mut self.instances[idx];
        instance.epoch += 1;

        if pause_idle && !instance.paused {
            if let Some(sandbox) = instance.sandbox.clone() {
                instance.state = InstanceState::Pausing;
                let id = instance.id;
                let events_tx = self.events_tx.clone();
                tokio::spawn(async move {
                    let result = sandbox.pause().await;
                    let _ = events_tx.send(InstanceEvent::Paused { id, result });
                });
                return;
            }
        }

        instance.state = InstanceState::Idle;
        let check = EvictionCheck {
            id: instance.id,
            epoch: instance.epoch,
        };
        self.schedule_eviction(check);
    }

    fn next_queued(&mut self) -> Option<Invocation> {
        self.backlog
            .pop_front()
            .or_else(|| self.invoke_rx.try_recv().ok())
    }

    fn dispatch(&mut self, idx: usize, mut invocation: Invocation) {
        let instance = &mut self.instances[idx];
        let Some(sandbox) = instance.sandbox.clone() else {
            invocation.fail(
                LambdaError::execution(&self.name, "instance has no sandbox"),
                &self.subsystems.stats,
            );
            return;
        };

        let cold = instance.served == 0;
        let unpause = instance.paused;
        instance.paused = false;
        instance.state = InstanceState::Busy;
        instance.served += 1;
        instance.epoch += 1;
        invocation.mark_dispatched(cold);

        let id = instance.id;
        let name = self.name.clone();
        let subsystems = Arc::clone(&self.subsystems);
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let fault = instance::serve(&name, sandbox, invocation, unpause, &subsystems).await;
            let _ = events_tx.send(InstanceEvent::Finished { id, fault });
        });
    }

    /// Launch instances for backlog entries that no starting or pausing
    /// instance will pick up, within the instance limit
    fn scale_up(&mut self) {
        let limit = self.config.instance_limit();
        loop {
            let upcoming = self.count(InstanceState::Starting) + self.count(InstanceState::Pausing);
            if self.backlog.len() <= upcoming || self.instances.len() >= limit {
                break;
            }
            self.launch();
        }
    }

    fn launch(&mut self) {
        let id = self.next_instance_id;
        self.next_instance_id += 1;
        self.instances.push(LambdaInstance::starting(id));
        tracing::debug!(
            "function {}: cold start of instance {} ({} live)",
            self.name,
            id,
            self.instances.len()
        );

        let name = self.name.clone();
        let subsystems = Arc::clone(&self.subsystems);
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = instance::provision(&name, &subsystems).await;
            let _ = events_tx.send(InstanceEvent::Provisioned { id, result });
        });
    }

    fn schedule_eviction(&self, check: EvictionCheck) {
        if self.config.idle_eviction_ms == 0 {
            return;
        }
        let delay = Duration::from_millis(self.config.idle_eviction_ms);
        let delay_tx = self.delay_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = delay_tx.send(check);
        });
    }

    fn handle_eviction_check(&mut self, check: EvictionCheck) {
        let Some(idx) = self.position(check.id) else { return };
        let instance = &self.instances[idx];
        // Reuse since the check was scheduled bumps the epoch
        if instance.state == InstanceState::Idle && instance.epoch == check.epoch {
            self.evict(idx, "idle");
        }
    }

    fn evict(&mut self, idx: usize, reason: &'static str) {
        let instance = self.instances.remove(idx);
        tracing::debug!(
            "function {}: evicting instance {} ({}), {} left",
            self.name,
            instance.id,
            reason,
            self.instances.len()
        );
        if let Some(sandbox) = instance.sandbox {
            self.teardown.spawn(async move { sandbox.destroy(reason).await });
        }
        self.refresh_cold_path();
    }

    fn handle_control(&mut self, cmd: FuncControl) {
        match cmd {
            FuncControl::Status { response_tx } => {
                let _ = response_tx.send(self.status());
            }
        }
    }

    fn status(&self) -> FuncStatus {
        FuncStatus {
            name: self.name.clone(),
            cold_path: self.cold_path,
            backlog: self.backlog.len(),
            queued: self.invoke_rx.len(),
            instances: self
                .instances
                .iter()
                .map(|instance| InstanceStatus {
                    id: instance.id,
                    sandbox_id: instance.sandbox.as_ref().map(|sb| sb.id().to_string()),
                    state: instance.state,
                    paused: instance.paused,
                    served: instance.served,
                })
                .collect(),
        }
    }

    /// Whether taking another invocation off the inbound queue can make
    /// progress. Otherwise it stays queued and producers feel backpressure.
    fn can_accept(&self) -> bool {
        let launchable = self
            .config
            .instance_limit()
            .saturating_sub(self.instances.len());
        let upcoming = self.count(InstanceState::Idle)
            + self.count(InstanceState::Starting)
            + self.count(InstanceState::Pausing)
            + launchable;
        self.backlog.len() < upcoming
    }

    fn idle_instance(&self) -> Option<usize> {
        self.instances
            .iter()
            .position(|instance| instance.state == InstanceState::Idle)
    }

    fn position(&self, id: u64) -> Option<usize> {
        self.instances.iter().position(|instance| instance.id == id)
    }

    fn count(&self, state: InstanceState) -> usize {
        self.instances.iter().filter(|i| i.state == state).count()
    }

    fn refresh_cold_path(&mut self) {
        self.cold_path = !self.instances.iter().any(LambdaInstance::is_ready);
    }

    async fn shutdown(mut self, kill_ack: Option<oneshot::Sender<()>>) {
        tracing::info!("killing function {}", self.name);
        let stats = Arc::clone(&self.subsystems.stats);

        // Nothing queued is dropped silently: drain and fail it
        self.invoke_rx.close();
        while let Some(invocation) = self.invoke_rx.recv().await {
            self.backlog.push_back(invocation);
        }
        let killed = LambdaError::FunctionKilled {
            function: self.name.clone(),
        };
        for invocation in self.backlog.drain(..) {
            invocation.fail(killed.clone(), &stats);
        }

        // Let in-flight provisioning, requests and pauses land
        while self.instances.iter().any(LambdaInstance::in_flight) {
            let Some(event) = self.events_rx.recv().await else { break };
            match event {
                InstanceEvent::Provisioned { id, result } => {
                    let Some(idx) = self.position(id) else { continue };
                    match result {
                        Ok(sandbox) => {
                            self.instances[idx].sandbox = Some(sandbox);
                            self.instances[idx].state = InstanceState::Idle;
                        }
                        Err(_) => {
                            self.instances.remove(idx);
                        }
                    }
                }
                InstanceEvent::Finished { id, .. } | InstanceEvent::Paused { id, .. } => {
                    if let Some(idx) = self.position(id) {
                        self.instances[idx].state = InstanceState::Idle;
                    }
                }
            }
        }

        for instance in std::mem::take(&mut self.instances) {
            if let Some(sandbox) = instance.sandbox {
                self.teardown.spawn(async move { sandbox.destroy("function killed").await });
            }
        }
        while let Some(result) = self.teardown.join_next().await {
            if let Err(err) = result {
                tracing::error!("function {}: sandbox destroy task failed: {}", self.name, err);
            }
        }
        self.cold_path = true;
        tracing::debug!("function {} scheduler stopped", self.name);

        if let Some(ack) = kill_ack {
            let _ = ack.send(());
        }
        self.kill_rx.close();
        while let Ok(ack) = self.kill_rx.try_recv() {
            let _ = ack.send(());
        }
    }
}
