#![deny(unreachable_patterns)]
//! Orchestration engine: `EpisodePipeline`, `Transcoder`, `TaskProtection`,
//! and the `Supervisor` that wires them to signals and the queue consumer.

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod supervisor;
pub mod task_protection;
pub mod transcoder;

pub use config::Config;
pub use error::{WorkerError, WorkerResult};
pub use pipeline::EpisodePipeline;
pub use supervisor::{Supervisor, SupervisorExit};
pub use task_protection::{EcsProtectionEnvironment, ProtectionEnvironment, TaskProtection, TaskProtectionConfig};
pub use transcoder::{ProcessEpisodeResult, Transcoder};
