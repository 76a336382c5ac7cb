//! Per-mailbox trigger engine.

mod engine_loop;
pub mod state;

pub use engine_loop::{Engine, EngineConfig, EngineDeps, EngineStats, spawn_engine};
pub use state::EngineState;
