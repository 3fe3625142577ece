pub mod config;
pub mod dirs;
pub mod stats;

pub use config::{QueuePolicy, SchedulerConfig, WorkerConfig};
pub use dirs::DirMaker;
pub use stats::{Stats, Timer};
