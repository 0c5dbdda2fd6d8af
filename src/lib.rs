//! Media pipeline bridge
//!
//! Runs engine pipelines from textual descriptions, relays the units their
//! application sinks produce, injects transport feedback, answers the RTP
//! session manager's retransmission and payload-type requests, and adjusts
//! encoder parameters while the pipeline plays.

pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod profile;
pub mod relay;
pub mod rtp;

pub use config::BridgeConfig;
pub use error::{BridgeError, Result, TerminalEvent};
pub use pipeline::{MainLoop, Pipeline, PipelineLifecycleManager, PipelineState};
pub use relay::consumer::{ChannelConsumer, PipelineConsumer, RelayEvent};
