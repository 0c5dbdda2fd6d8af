//! Pipeline lifecycle, state and health
//!
//! - `lifecycle`: creating pipelines from descriptions, wiring the relay and
//!   the RTP hooks to named stages, start and stop
//! - `state`: the Null/Ready/Paused/Playing state machine
//! - `health`: per-pipeline counters and the stall monitor
//! - `main_loop`: the engine event loop the application pumps

pub mod health;
pub mod lifecycle;
pub mod main_loop;
pub mod state;
pub mod types;

pub use health::{HealthMonitor, RelayHealth};
pub use lifecycle::{Pipeline, PipelineLifecycleManager, WiringReport};
pub use main_loop::MainLoop;
pub use state::PipelineState;
pub use types::{DataUnit, MediaKind, PipelineId, StatsSample};
