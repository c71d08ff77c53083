pub mod api;
pub mod database;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod status;
pub mod utils;

pub use database::{Database, ProgressStore, StoreError, TickerRegistry};
pub use orchestrator::{Orchestrator, OrchestratorError, OrchestratorSettings, RunMode, RunRequest, RunSummary};
