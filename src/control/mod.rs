//! Runtime control of a playing pipeline
//!
//! - `parameters`: live encoder property changes by stage name
//! - `adaptation`: bitrate policies fed by transport stats and estimates

pub mod adaptation;
pub mod parameters;

pub use adaptation::{BitrateAdapter, Congestion, Estimate, EstimateApplier};
pub use parameters::{Applied, ParameterController, StageParameter};
