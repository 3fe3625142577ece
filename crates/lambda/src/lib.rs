//! Lambda scheduling for a serverless worker.
//!
//! [`LambdaMgr`] owns the worker's subsystems and a registry of functions.
//! Each [`LambdaFunc`] runs its own scheduling task, which routes
//! [`Invocation`]s to sandbox-backed instances, scales them up to a limit and
//! evicts the ones that stay idle.

pub mod dep_tracer;
pub mod error;
pub mod func;
pub mod import_cache;
mod instance;
pub mod invocation;
pub mod manager;
pub mod puller;
pub mod report;

pub use dep_tracer::DepTracer;
pub use error::LambdaError;
pub use func::{FuncStatus, InstanceStatus, LambdaFunc};
pub use import_cache::{ImportCache, PoolFallback};
pub use instance::InstanceState;
pub use invocation::{Completion, Invocation, InvocationHandle, InvocationState};
pub use manager::{ImportCacheDeps, LambdaMgr, SubsystemProvider};
pub use puller::{HandlerCode, HandlerPuller, InstalledPackage, PackagePuller};
