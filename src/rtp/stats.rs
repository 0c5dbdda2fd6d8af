//! Transport statistics extraction
//!
//! The session manager publishes a congestion-control snapshot at its own
//! cadence. This layer only decodes it and forwards it; smoothing belongs to
//! whoever consumes the samples (see `control::adaptation`).

use log::{debug, warn};
use std::sync::Arc;

use crate::engine::{FieldValue, StatsRecord};
use crate::pipeline::health::RelayHealth;
use crate::pipeline::types::{PipelineId, StatsSample};
use crate::relay::consumer::PipelineConsumer;

pub const BITRATE_SENT: &str = "bitrate-sent";
pub const BITRATE_RECV: &str = "bitrate-recv";
pub const PACKETS_SENT: &str = "packets-sent";
pub const PACKETS_RECV: &str = "packets-recv";
pub const AVG_DELTA_OF_DELTA: &str = "avg-delta-of-delta";

/// Why a snapshot could not be decoded
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StatsDecodeError {
    #[error("stats field `{0}` is missing")]
    Missing(&'static str),

    #[error("stats field `{field}` does not fit: {value:?}")]
    OutOfRange {
        field: &'static str,
        value: FieldValue,
    },
}

fn unsigned(record: &StatsRecord, field: &'static str) -> Result<u32, StatsDecodeError> {
    let value = record.get(field).ok_or(StatsDecodeError::Missing(field))?;
    let decoded = match value {
        FieldValue::UInt(v) => u32::try_from(v).ok(),
        FieldValue::Int(v) => u32::try_from(v).ok(),
        FieldValue::Double(_) => None,
    };
    decoded.ok_or(StatsDecodeError::OutOfRange { field, value })
}

fn signed(record: &StatsRecord, field: &'static str) -> Result<i64, StatsDecodeError> {
    let value = record.get(field).ok_or(StatsDecodeError::Missing(field))?;
    let decoded = match value {
        FieldValue::Int(v) => Some(v),
        FieldValue::UInt(v) => i64::try_from(v).ok(),
        FieldValue::Double(_) => None,
    };
    decoded.ok_or(StatsDecodeError::OutOfRange { field, value })
}

/// Decodes stats snapshots and forwards them to the pipeline's consumer
pub struct StatsAggregator {
    pipeline: PipelineId,
    consumer: Arc<dyn PipelineConsumer>,
    health: Arc<RelayHealth>,
}

impl StatsAggregator {
    pub fn new(
        pipeline: PipelineId,
        consumer: Arc<dyn PipelineConsumer>,
        health: Arc<RelayHealth>,
    ) -> Self {
        Self {
            pipeline,
            consumer,
            health,
        }
    }

    /// Decode the five numeric fields of a snapshot
    pub fn decode(record: &StatsRecord) -> Result<StatsSample, StatsDecodeError> {
        Ok(StatsSample {
            bitrate_sent: unsigned(record, BITRATE_SENT)?,
            bitrate_recv: unsigned(record, BITRATE_RECV)?,
            packets_sent: unsigned(record, PACKETS_SENT)?,
            packets_recv: unsigned(record, PACKETS_RECV)?,
            avg_delta_of_delta: signed(record, AVG_DELTA_OF_DELTA)?,
        })
    }

    /// Handle a stats notification from the session manager
    ///
    /// Undecodable snapshots are logged, counted and dropped.
    pub fn on_stats_notification(&self, record: &StatsRecord) -> Option<StatsSample> {
        match Self::decode(record) {
            Ok(sample) => {
                debug!("StatsAggregator: pipeline {} {}", self.pipeline, sample);
                self.health.record_stats_sample();
                self.consumer.on_stats(self.pipeline, sample);
                Some(sample)
            }
            Err(e) => {
                warn!("StatsAggregator: dropping `{}` snapshot: {}", record.name(), e);
                self.health.record_stats_decode_failure();
                None
            }
        }
    }
}
