//! Buffer relay: moves completed units from sink stages to the application
//!
//! One relay is bound per sink. It runs on that sink's streaming thread, so
//! units from one sink reach the consumer in the order the engine produced
//! them, while units from different sinks can interleave freely.
//!
//! Each unit is copied out of engine memory before the consumer sees it and
//! the engine sample is released before the consumer runs.

pub mod consumer;

use log::trace;
use std::sync::Arc;

use crate::engine::{SinkStage, UnitReadyHandler};
use crate::pipeline::health::RelayHealth;
use crate::pipeline::types::DataUnit;
use consumer::{PipelineConsumer, UnitOrigin};

/// What a single notification produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// A unit of this many bytes was handed to the consumer
    Delivered(usize),
    /// Spurious notification: nothing was ready
    Empty,
}

/// Relay bound to one sink stage
pub struct BufferRelay {
    origin: UnitOrigin,
    consumer: Arc<dyn PipelineConsumer>,
    health: Arc<RelayHealth>,
}

impl BufferRelay {
    pub fn new(
        origin: UnitOrigin,
        consumer: Arc<dyn PipelineConsumer>,
        health: Arc<RelayHealth>,
    ) -> Self {
        Self {
            origin,
            consumer,
            health,
        }
    }

    pub fn origin(&self) -> &UnitOrigin {
        &self.origin
    }

    /// Handle one "unit ready" notification from `sink`
    pub fn on_unit_ready(&self, sink: &dyn SinkStage) -> RelayOutcome {
        let Some(sample) = sink.pull_sample() else {
            self.health.record_empty_notification();
            return RelayOutcome::Empty;
        };

        let unit = match sample.buffer() {
            Some(view) => DataUnit::copy_from(view.bytes(), view.duration, view.pts),
            None => {
                self.health.record_empty_notification();
                return RelayOutcome::Empty;
            }
        };
        drop(sample);

        let size = unit.len();
        trace!("BufferRelay: {} {} -> {:?}", self.origin.pipeline, self.origin.sink, unit);
        self.health.record_unit(size);
        self.consumer.on_data_unit(&self.origin, unit);

        RelayOutcome::Delivered(size)
    }

    /// Engine-facing handler that feeds notifications into this relay
    pub fn into_handler(self: Arc<Self>) -> UnitReadyHandler {
        Arc::new(move |sink: &dyn SinkStage| {
            self.on_unit_ready(sink);
        })
    }
}
