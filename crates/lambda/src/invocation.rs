//! One request/response exchange travelling through a function's scheduler.

use std::sync::Arc;

use bytes::Bytes;
use common::Stats;
use hyper::{Request, Response};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::LambdaError;

const ID_LEN: usize = 12;

/// Lifecycle of an invocation. Terminal states fire the completion signal.
///
/// An invocation that never reached an instance (kill, rejection, failed
/// provisioning) fails straight from `Queued`. Once dispatched it always
/// passes through `Executing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum InvocationState {
    Queued,
    Dispatched,
    Executing,
    Completed,
    Failed,
}

/// What the caller receives once the invocation reaches a terminal state
#[derive(Debug)]
pub struct Completion {
    pub invocation_id: String,
    pub result: Result<Response<Bytes>, LambdaError>,
    /// Time between arrival and dispatch to an instance
    pub queuing_ms: u64,
    /// Sandbox round trip only; zero when the invocation never executed
    pub exec_ms: u64,
    /// Served by an instance on its first request
    pub cold: bool,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct Invocation {
    id: String,
    request: Option<Request<Bytes>>,
    done: Option<oneshot::Sender<Completion>>,
    queue_start: Instant,
    queuing_ms: Option<u64>,
    exec_ms: Option<u64>,
    cold: bool,
    state: InvocationState,
}

/// Caller side of an invocation
pub struct InvocationHandle {
    id: String,
    rx: oneshot::Receiver<Completion>,
}

impl InvocationHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(self) -> Completion {
        match self.rx.await {
            Ok(completion) => completion,
            // Only reachable if the runtime tore down the task holding the invocation
            Err(_) => Completion {
                invocation_id: self.id,
                result: Err(LambdaError::ManagerClosed),
                queuing_ms: 0,
                exec_ms: 0,
                cold: false,
            },
        }
    }
}

impl Invocation {
    /// Create a queued invocation; its queue clock starts now
    pub fn new(request: Request<Bytes>) -> (Self, InvocationHandle) {
        let (tx, rx) = oneshot::channel();
        let id = nanoid::nanoid!(ID_LEN);
        let invocation = Self {
            id: id.clone(),
            request: Some(request),
            done: Some(tx),
            queue_start: Instant::now(),
            queuing_ms: None,
            exec_ms: None,
            cold: false,
            state: InvocationState::Queued,
        };
        (invocation, InvocationHandle { id, rx })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> InvocationState {
        self.state
    }

    pub fn queue_start(&self) -> Instant {
        self.queue_start
    }

    pub fn queuing_ms(&self) -> Option<u64> {
        self.queuing_ms
    }

    /// Hand the invocation to an instance; fixes the queuing delay
    pub(crate) fn mark_dispatched(&mut self, cold: bool) {
        debug_assert_eq!(self.state, InvocationState::Queued);
        self.queuing_ms = Some(self.queue_start.elapsed().as_millis() as u64);
        self.cold = cold;
        self.state = InvocationState::Dispatched;
    }

    pub(crate) fn begin_execution(&mut self) -> Request<Bytes> {
        debug_assert_eq!(self.state, InvocationState::Dispatched);
        self.state = InvocationState::Executing;
        self.request.take().unwrap_or_default()
    }

    pub(crate) fn set_exec_ms(&mut self, exec_ms: u64) {
        debug_assert!(self.exec_ms.is_none());
        self.exec_ms = Some(exec_ms);
    }

    pub(crate) fn complete(self, response: Response<Bytes>, stats: &Arc<Stats>) {
        debug_assert_eq!(self.state, InvocationState::Executing);
        self.finish(InvocationState::Completed, Ok(response), stats);
    }

    /// Fail from `Queued` or `Executing`
    pub(crate) fn fail(self, err: LambdaError, stats: &Arc<Stats>) {
        debug_assert_ne!(self.state, InvocationState::Dispatched);
        self.finish(InvocationState::Failed, Err(err), stats);
    }

    fn finish(
        mut self,
        state: InvocationState,
        result: Result<Response<Bytes>, LambdaError>,
        stats: &Arc<Stats>,
    ) {
        let elapsed = self.queue_start.elapsed();
        self.state = state;
        let queuing_ms = *self
            .queuing_ms
            .get_or_insert(elapsed.as_millis() as u64);
        let exec_ms = *self.exec_ms.get_or_insert(0);
        stats.record("LambdaFunc.Invoke", elapsed);

        if let Some(done) = self.done.take() {
            let _ = done.send(Completion {
                invocation_id: self.id.clone(),
                result,
                queuing_ms,
                exec_ms,
                cold: self.cold,
            });
        }
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            self.state = InvocationState::Failed;
            let _ = done.send(Completion {
                invocation_id: self.id.clone(),
                result: Err(LambdaError::ManagerClosed),
                queuing_ms: self.queuing_ms.unwrap_or(0),
                exec_ms: self.exec_ms.unwrap_or(0),
                cold: self.cold,
            });
        }
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("queuing_ms", &self.queuing_ms)
            .field("exec_ms", &self.exec_ms)
            .finish()
    }
}
