//! Tunnel module root – re-exports public API surface.

pub mod types;
pub mod config;
pub mod control;
pub mod engine;
pub mod backend;
pub mod process;
pub mod library;
pub mod stats;
pub mod settings;
pub mod orchestrator;

pub use types::*;
pub use backend::{BackendEvent, EngineSample, StartRequest, StatisticsSource, TunnelBackend};
pub use control::{ControlChannel, QueryReply};
pub use engine::EngineLocator;
pub use library::{LibraryBackend, LoopbackLibrary, TunnelLibrary};
pub use orchestrator::Orchestrator;
pub use process::ProcessBackend;
pub use settings::{OrchestratorSettings, ProcessSettings, Settings};
