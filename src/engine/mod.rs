//! Media engine interface
//!
//! The bridge never talks to a concrete engine directly. Everything it needs
//! (parsing a description, finding stages by name, the sink/source/session
//! hooks, the bus and the event loop) goes through these traits, so the same
//! wiring drives GStreamer in production and the in-process simulator in tests.
//!
//! Handlers registered here are invoked on engine-owned threads: sink
//! notifications on each sink's streaming thread, bus events and stats on the
//! thread pumping the event loop.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use crate::pipeline::state::PipelineState;
use crate::rtp::payload::CapabilityDescriptor;
use crate::rtp::retransmit::RetransmitStage;

#[cfg(feature = "gstreamer")]
pub mod gst;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

/// Failures reported by an engine backend
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("engine could not parse the description: {0}")]
    Parse(String),

    #[error("state change to {target} failed: {reason}")]
    StateChange {
        target: PipelineState,
        reason: String,
    },

    #[error("stage `{stage}` has no property `{property}`")]
    UnknownProperty { stage: String, property: String },

    #[error("stage `{stage}` rejected property `{property}`: {reason}")]
    Property {
        stage: String,
        property: String,
        reason: String,
    },

    #[error("stage `{stage}` refused the buffer: {reason}")]
    Push { stage: String, reason: String },

    #[error("engine failure: {0}")]
    Other(String),
}

/// Value written into a stage property
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    UInt(u64),
    Int(i64),
    Bool(bool),
    Str(String),
}

impl PropertyValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PropertyValue::UInt(v) => Some(*v),
            PropertyValue::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::UInt(v) => write!(f, "{}", v),
            PropertyValue::Int(v) => write!(f, "{}", v),
            PropertyValue::Bool(v) => write!(f, "{}", v),
            PropertyValue::Str(v) => write!(f, "{}", v),
        }
    }
}

/// Messages posted on the pipeline bus
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    EndOfStream,
    Error {
        message: String,
        debug: Option<String>,
    },
    Warning {
        message: String,
    },
    /// Anything else, by message type name
    Other(String),
}

/// Numeric field inside an engine structure
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    UInt(u64),
    Int(i64),
    Double(f64),
}

/// Flat copy of an engine structure (e.g. the `twcc-stats` snapshot)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsRecord {
    name: String,
    fields: Vec<(String, FieldValue)>,
}

impl StatsRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Builder-style insert
    pub fn with(mut self, field: impl Into<String>, value: FieldValue) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: FieldValue) {
        let field = field.into();
        match self.fields.iter_mut().find(|(name, _)| *name == field) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((field, value)),
        }
    }

    pub fn get(&self, field: &str) -> Option<FieldValue> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| *value)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Read access to a buffer the engine still owns
///
/// The slice is only valid while the view is alive; anything that must
/// outlive the notification has to be copied.
pub struct BufferView<'a> {
    data: Box<dyn AsRef<[u8]> + 'a>,
    pub duration: Option<Duration>,
    pub pts: Option<Duration>,
}

impl<'a> BufferView<'a> {
    pub fn new(
        data: impl AsRef<[u8]> + 'a,
        duration: Option<Duration>,
        pts: Option<Duration>,
    ) -> Self {
        Self {
            data: Box::new(data),
            duration,
            pts,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        (*self.data).as_ref()
    }
}

/// A sample pulled from a sink
pub trait EngineSample: Send {
    /// The sample's buffer, if it carries one
    fn buffer(&self) -> Option<BufferView<'_>>;
}

pub type UnitReadyHandler = Arc<dyn Fn(&dyn SinkStage) + Send + Sync>;
pub type BusHandler = Arc<dyn Fn(BusEvent) + Send + Sync>;
pub type AuxSenderHandler = Arc<dyn Fn(u32) -> Option<Arc<RetransmitStage>> + Send + Sync>;
pub type PayloadMapHandler = Arc<dyn Fn(u32, u32) -> Option<CapabilityDescriptor> + Send + Sync>;
pub type StatsHandler = Arc<dyn Fn(&StatsRecord) + Send + Sync>;

/// Entry point of an engine backend
pub trait MediaEngine: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Build a graph from a textual description, without starting it
    fn launch(&self, description: &str) -> Result<Arc<dyn EngineGraph>, EngineError>;

    /// The loop that delivers bus messages and property notifications
    fn event_loop(&self) -> Arc<dyn EngineLoop>;
}

/// Event loop pumped by the application
pub trait EngineLoop: Send + Sync {
    /// Block the calling thread dispatching events until `quit` is called
    fn run(&self);

    fn quit(&self);

    fn is_running(&self) -> bool;
}

/// A graph built by the engine
pub trait EngineGraph: Send + Sync {
    /// Look up a stage by name; `None` when absent
    fn stage(&self, name: &str) -> Option<Arc<dyn EngineStage>>;

    fn set_state(&self, state: PipelineState) -> Result<(), EngineError>;

    fn current_state(&self) -> PipelineState;

    /// Install the terminal-event watch
    fn watch_bus(&self, handler: BusHandler) -> Result<(), EngineError>;

    fn unwatch_bus(&self);
}

/// A named node of a graph
pub trait EngineStage: Send + Sync {
    fn name(&self) -> String;

    /// Engine factory the stage was built from (e.g. `appsink`, `vp8enc`)
    fn factory(&self) -> String;

    fn set_property(&self, property: &str, value: PropertyValue) -> Result<(), EngineError>;

    fn as_sink(&self) -> Option<&dyn SinkStage> {
        None
    }

    fn as_source(&self) -> Option<&dyn SourceStage> {
        None
    }

    fn as_session_manager(&self) -> Option<&dyn SessionManagerStage> {
        None
    }
}

/// Application sink: hands completed units out of the graph
pub trait SinkStage: Send + Sync {
    /// Ask the sink to emit "unit ready" notifications
    fn enable_unit_ready(&self) -> Result<(), EngineError>;

    fn connect_unit_ready(&self, handler: UnitReadyHandler) -> Result<(), EngineError>;

    /// Take the pending sample without blocking
    fn pull_sample(&self) -> Option<Box<dyn EngineSample>>;
}

/// Application source: external bytes enter the graph here
pub trait SourceStage: Send + Sync {
    fn push_buffer(&self, data: Bytes) -> Result<(), EngineError>;
}

/// RTP session manager (rtpbin)
pub trait SessionManagerStage: Send + Sync {
    fn connect_aux_sender(&self, handler: AuxSenderHandler) -> Result<(), EngineError>;

    fn connect_payload_map(&self, handler: PayloadMapHandler) -> Result<(), EngineError>;

    fn connect_stats(&self, handler: StatsHandler) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_record_insert_replaces() {
        let mut record = StatsRecord::new("RTPTWCCStats").with("bitrate-sent", FieldValue::UInt(10));
        record.insert("bitrate-sent", FieldValue::UInt(20));

        assert_eq!(record.get("bitrate-sent"), Some(FieldValue::UInt(20)));
        assert_eq!(record.get("bitrate-recv"), None);
        assert_eq!(record.name(), "RTPTWCCStats");
    }

    #[test]
    fn test_buffer_view_borrows() {
        let memory = vec![9u8, 8, 7];
        let view = BufferView::new(&memory[..], Some(Duration::from_millis(5)), None);
        assert_eq!(view.bytes(), &[9, 8, 7]);
        assert_eq!(view.duration, Some(Duration::from_millis(5)));
    }

    #[test]
    fn test_property_value_as_u64() {
        assert_eq!(PropertyValue::UInt(5).as_u64(), Some(5));
        assert_eq!(PropertyValue::Int(-1).as_u64(), None);
        assert_eq!(PropertyValue::Str("x".into()).as_u64(), None);
    }
}
