//! GStreamer backend
//!
//! `gst::parse::launch` builds the graph; `appsink`, `appsrc` and `rtpbin`
//! stages get the sink, source and session manager roles.

use bytes::Bytes;
use gst::glib;
use gst::prelude::*;
use gstreamer as gst;
use gstreamer_app as gst_app;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{
    AuxSenderHandler, BufferView, BusEvent, BusHandler, EngineError, EngineGraph, EngineLoop, EngineSample,
    EngineStage, FieldValue, MediaEngine, PayloadMapHandler, PropertyValue, SessionManagerStage, SinkStage,
    SourceStage, StatsHandler, StatsRecord, UnitReadyHandler,
};
use crate::pipeline::state::PipelineState;
use crate::rtp::payload::CapabilityDescriptor;
use crate::rtp::retransmit::RetransmitStage;

const SESSION_MANAGER_FACTORY: &str = "rtpbin";

fn to_gst_state(state: PipelineState) -> gst::State {
    match state {
        PipelineState::Null => gst::State::Null,
        PipelineState::Ready => gst::State::Ready,
        PipelineState::Paused => gst::State::Paused,
        PipelineState::Playing => gst::State::Playing,
    }
}

fn from_gst_state(state: gst::State) -> PipelineState {
    match state {
        gst::State::Ready => PipelineState::Ready,
        gst::State::Paused => PipelineState::Paused,
        gst::State::Playing => PipelineState::Playing,
        _ => PipelineState::Null,
    }
}

fn clock_to_duration(time: Option<gst::ClockTime>) -> Option<Duration> {
    time.map(|t| Duration::from_nanos(t.nseconds()))
}

/// GStreamer engine; initialises GStreamer once on construction
pub struct GstEngine {
    main_loop: Arc<GstLoop>,
}

impl GstEngine {
    pub fn new() -> Result<Self, EngineError> {
        gst::init().map_err(|e| EngineError::Other(format!("GStreamer init failed: {}", e)))?;
        info!("GstEngine: GStreamer {}", gst::version_string());
        Ok(Self {
            main_loop: Arc::new(GstLoop {
                inner: glib::MainLoop::new(None, false),
            }),
        })
    }
}

impl MediaEngine for GstEngine {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn launch(&self, description: &str) -> Result<Arc<dyn EngineGraph>, EngineError> {
        let element = gst::parse::launch(description).map_err(|e| EngineError::Parse(e.to_string()))?;

        // a single-stage description parses to a bare element
        let pipeline = match element.downcast::<gst::Pipeline>() {
            Ok(pipeline) => pipeline,
            Err(element) => {
                let pipeline = gst::Pipeline::new();
                pipeline
                    .add(&element)
                    .map_err(|e| EngineError::Parse(e.to_string()))?;
                pipeline
            }
        };

        Ok(Arc::new(GstGraph {
            pipeline,
            bus_watch: Mutex::new(None),
        }))
    }

    fn event_loop(&self) -> Arc<dyn EngineLoop> {
        self.main_loop.clone()
    }
}

/// Default-context GLib main loop: bus watches dispatch here
struct GstLoop {
    inner: glib::MainLoop,
}

impl EngineLoop for GstLoop {
    fn run(&self) {
        self.inner.run();
    }

    fn quit(&self) {
        self.inner.quit();
    }

    fn is_running(&self) -> bool {
        self.inner.is_running()
    }
}

struct GstGraph {
    pipeline: gst::Pipeline,
    bus_watch: Mutex<Option<gst::bus::BusWatchGuard>>,
}

impl EngineGraph for GstGraph {
    // Handles are built per lookup; signal closures own whatever they cache
    fn stage(&self, name: &str) -> Option<Arc<dyn EngineStage>> {
        let element = self.pipeline.by_name(name)?;
        Some(Arc::new(GstStage::new(name, element)))
    }

    fn set_state(&self, state: PipelineState) -> Result<(), EngineError> {
        match self.pipeline.set_state(to_gst_state(state)) {
            Ok(success) => {
                debug!("GstGraph: {} -> {:?}", state, success);
                Ok(())
            }
            Err(e) => Err(EngineError::StateChange {
                target: state,
                reason: e.to_string(),
            }),
        }
    }

    fn current_state(&self) -> PipelineState {
        from_gst_state(self.pipeline.current_state())
    }

    fn watch_bus(&self, handler: BusHandler) -> Result<(), EngineError> {
        let mut slot = self.bus_watch.lock();
        if slot.is_some() {
            return Err(EngineError::Other("bus is already watched".to_string()));
        }
        let bus = self
            .pipeline
            .bus()
            .ok_or_else(|| EngineError::Other("pipeline has no bus".to_string()))?;

        let guard = bus
            .add_watch(move |_, msg| {
                use gst::MessageView;

                let event = match msg.view() {
                    MessageView::Eos(_) => BusEvent::EndOfStream,
                    MessageView::Error(err) => BusEvent::Error {
                        message: err.error().to_string(),
                        debug: err.debug().map(|d| d.to_string()),
                    },
                    MessageView::Warning(w) => BusEvent::Warning {
                        message: w.error().to_string(),
                    },
                    _ => return glib::ControlFlow::Continue,
                };
                handler(event);
                glib::ControlFlow::Continue
            })
            .map_err(|e| EngineError::Other(e.to_string()))?;

        *slot = Some(guard);
        Ok(())
    }

    fn unwatch_bus(&self) {
        // dropping the guard removes the watch
        self.bus_watch.lock().take();
    }
}

enum Role {
    Sink(GstSink),
    Source(gst_app::AppSrc),
    SessionManager(GstSessionManager),
    Plain,
}

struct GstStage {
    name: String,
    element: gst::Element,
    role: Role,
}

impl GstStage {
    fn new(name: &str, element: gst::Element) -> Self {
        let role = if let Some(sink) = element.downcast_ref::<gst_app::AppSink>() {
            Role::Sink(GstSink { sink: sink.clone() })
        } else if let Some(src) = element.downcast_ref::<gst_app::AppSrc>() {
            Role::Source(src.clone())
        } else if factory_name(&element).as_deref() == Some(SESSION_MANAGER_FACTORY) {
            Role::SessionManager(GstSessionManager {
                element: element.clone(),
                aux_senders: Arc::new(Mutex::new(HashMap::new())),
            })
        } else {
            Role::Plain
        };

        Self {
            name: name.to_string(),
            element,
            role,
        }
    }
}

fn factory_name(element: &gst::Element) -> Option<String> {
    element.factory().map(|f| f.name().to_string())
}

fn property_value(pspec: &glib::ParamSpec, value: &PropertyValue) -> Result<glib::Value, String> {
    let ty = pspec.value_type();
    let integer = match value {
        PropertyValue::UInt(v) => Some(i128::from(*v)),
        PropertyValue::Int(v) => Some(i128::from(*v)),
        _ => None,
    };
    let out_of_range = || format!("{} is out of range for {}", value, ty);

    macro_rules! ranged {
        ($int:ty, $spec:ty) => {{
            let n = integer.ok_or_else(|| format!("expects {}", ty))?;
            let v = <$int>::try_from(n).map_err(|_| out_of_range())?;
            if let Some(spec) = pspec.downcast_ref::<$spec>() {
                if v < spec.minimum() || v > spec.maximum() {
                    return Err(out_of_range());
                }
            }
            Ok(v.to_value())
        }};
    }

    if ty == glib::Type::U32 {
        ranged!(u32, glib::ParamSpecUInt)
    } else if ty == glib::Type::I32 {
        ranged!(i32, glib::ParamSpecInt)
    } else if ty == glib::Type::U64 {
        ranged!(u64, glib::ParamSpecUInt64)
    } else if ty == glib::Type::I64 {
        ranged!(i64, glib::ParamSpecInt64)
    } else if ty == glib::Type::BOOL {
        match value {
            PropertyValue::Bool(v) => Ok(v.to_value()),
            _ => Err(format!("expects {}", ty)),
        }
    } else if ty == glib::Type::STRING {
        match value {
            PropertyValue::Str(v) => Ok(v.to_value()),
            other => Ok(other.to_string().to_value()),
        }
    } else {
        Err(format!("properties of type {} are not supported", ty))
    }
}

impl EngineStage for GstStage {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn factory(&self) -> String {
        factory_name(&self.element).unwrap_or_default()
    }

    fn set_property(&self, property: &str, value: PropertyValue) -> Result<(), EngineError> {
        let pspec = self
            .element
            .find_property(property)
            .ok_or_else(|| EngineError::UnknownProperty {
                stage: self.name.clone(),
                property: property.to_string(),
            })?;
        let rejected = |reason: String| EngineError::Property {
            stage: self.name.clone(),
            property: property.to_string(),
            reason,
        };

        if !pspec.flags().contains(glib::ParamFlags::WRITABLE) {
            return Err(rejected("not writable".to_string()));
        }
        let value = property_value(&pspec, &value).map_err(rejected)?;
        self.element.set_property_from_value(property, &value);
        Ok(())
    }

    fn as_sink(&self) -> Option<&dyn SinkStage> {
        match &self.role {
            Role::Sink(sink) => Some(sink),
            _ => None,
        }
    }

    fn as_source(&self) -> Option<&dyn SourceStage> {
        match &self.role {
            Role::Source(src) => Some(src),
            _ => None,
        }
    }

    fn as_session_manager(&self) -> Option<&dyn SessionManagerStage> {
        match &self.role {
            Role::SessionManager(manager) => Some(manager),
            _ => None,
        }
    }
}

struct GstSink {
    sink: gst_app::AppSink,
}

struct GstSample(gst::Sample);

impl EngineSample for GstSample {
    fn buffer(&self) -> Option<BufferView<'_>> {
        let buffer = self.0.buffer()?;
        let map = buffer.map_readable().ok()?;
        Some(BufferView::new(
            map,
            clock_to_duration(buffer.duration()),
            clock_to_duration(buffer.pts()),
        ))
    }
}

impl SinkStage for GstSink {
    fn enable_unit_ready(&self) -> Result<(), EngineError> {
        self.sink.set_emit_signals(true);
        Ok(())
    }

    fn connect_unit_ready(&self, handler: UnitReadyHandler) -> Result<(), EngineError> {
        self.sink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let stage = GstSink { sink: sink.clone() };
                    handler(&stage);
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );
        Ok(())
    }

    fn pull_sample(&self) -> Option<Box<dyn EngineSample>> {
        self.sink
            .try_pull_sample(gst::ClockTime::ZERO)
            .map(|sample| Box::new(GstSample(sample)) as Box<dyn EngineSample>)
    }
}

impl SourceStage for gst_app::AppSrc {
    fn push_buffer(&self, data: Bytes) -> Result<(), EngineError> {
        gst_app::AppSrc::push_buffer(self, gst::Buffer::from_slice(data))
            .map(|_| ())
            .map_err(|e| EngineError::Push {
                stage: self.name().to_string(),
                reason: format!("{:?}", e),
            })
    }
}

struct GstSessionManager {
    element: gst::Element,
    // realised retransmit bins, one per session
    aux_senders: Arc<Mutex<HashMap<u32, gst::Element>>>,
}

/// `rtprtxsend` inside a bin exposing `src_<session>`/`sink_<session>`
fn realise_retransmit(stage: &RetransmitStage) -> Result<gst::Element, glib::BoolError> {
    let bin = gst::Bin::new();
    let rtx = gst::ElementFactory::make("rtprtxsend").build()?;

    let mut map = gst::Structure::builder("application/x-rtp-pt-map");
    for (pt, rtx_pt) in stage.payload_map() {
        map = map.field(pt.to_string(), u32::from(*rtx_pt));
    }
    rtx.set_property("payload-type-map", map.build());
    bin.add(&rtx)?;

    let pads = [("src", stage.src_pad()), ("sink", stage.sink_pad())];
    for (target, ghost) in pads {
        let target = rtx
            .static_pad(target)
            .ok_or_else(|| glib::bool_error!("rtprtxsend has no {} pad", target))?;
        let ghost = gst::GhostPad::builder_with_target(&target)?.name(ghost).build();
        bin.add_pad(&ghost)?;
    }

    Ok(bin.upcast())
}

fn capability_caps(capability: &CapabilityDescriptor) -> gst::Caps {
    let mut caps = gst::Caps::builder("application/x-rtp")
        .field("media", capability.media.as_str())
        .field("payload", i32::from(capability.payload_type))
        .field("clock-rate", capability.clock_rate as i32)
        .field("encoding-name", capability.encoding_name());
    if let Some(extension) = &capability.extension {
        caps = caps.field(format!("extmap-{}", extension.id), extension.uri);
    }
    caps.build()
}

fn field_value(value: &glib::SendValue) -> Option<FieldValue> {
    if let Ok(v) = value.get::<u32>() {
        Some(FieldValue::UInt(u64::from(v)))
    } else if let Ok(v) = value.get::<u64>() {
        Some(FieldValue::UInt(v))
    } else if let Ok(v) = value.get::<i32>() {
        Some(FieldValue::Int(i64::from(v)))
    } else if let Ok(v) = value.get::<i64>() {
        Some(FieldValue::Int(v))
    } else if let Ok(v) = value.get::<f64>() {
        Some(FieldValue::Double(v))
    } else {
        None
    }
}

fn stats_record(structure: &gst::StructureRef) -> StatsRecord {
    let mut record = StatsRecord::new(structure.name().as_str());
    for (field, value) in structure.iter() {
        if let Some(value) = field_value(value) {
            record.insert(field.as_str(), value);
        }
    }
    record
}

fn signal_arg(values: &[glib::Value], index: usize) -> Option<u32> {
    values.get(index)?.get::<u32>().ok()
}

/// `request-aux-sender` reply: the session's retransmit bin or a NULL element
///
/// Signals with a return type must always hand back a value, so every
/// unanswered request becomes a typed NULL.
fn aux_sender_reply(
    handler: &AuxSenderHandler,
    realised: &Mutex<HashMap<u32, gst::Element>>,
    values: &[glib::Value],
) -> glib::Value {
    let bin = signal_arg(values, 1).and_then(|session| {
        let stage = handler(session)?;

        let mut realised = realised.lock();
        if let Some(bin) = realised.get(&session) {
            return Some(bin.clone());
        }
        match realise_retransmit(&stage) {
            Ok(bin) => {
                realised.insert(session, bin.clone());
                Some(bin)
            }
            Err(e) => {
                warn!("GstSessionManager: retransmit bin for session {} failed: {}", session, e);
                None
            }
        }
    });
    bin.to_value()
}

/// `request-pt-map` reply: caps for a known payload type, NULL caps otherwise
fn payload_map_reply(handler: &PayloadMapHandler, values: &[glib::Value]) -> glib::Value {
    let caps = signal_arg(values, 1)
        .zip(signal_arg(values, 2))
        .and_then(|(session, payload_type)| handler(session, payload_type))
        .map(|capability| capability_caps(&capability));
    caps.to_value()
}

impl SessionManagerStage for GstSessionManager {
    fn connect_aux_sender(&self, handler: AuxSenderHandler) -> Result<(), EngineError> {
        let realised = self.aux_senders.clone();
        self.element.connect("request-aux-sender", false, move |values| {
            Some(aux_sender_reply(&handler, &realised, values))
        });
        Ok(())
    }

    fn connect_payload_map(&self, handler: PayloadMapHandler) -> Result<(), EngineError> {
        self.element.connect("request-pt-map", false, move |values| {
            Some(payload_map_reply(&handler, values))
        });
        Ok(())
    }

    fn connect_stats(&self, handler: StatsHandler) -> Result<(), EngineError> {
        // twcc-stats lives on the rtpsession children; deep-notify lifts it to rtpbin
        self.element
            .connect_deep_notify(Some("twcc-stats"), move |_, origin, _| {
                if let Some(stats) = origin.property::<Option<gst::Structure>>("twcc-stats") {
                    handler(&stats_record(&stats));
                }
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::payload::DynamicPayloadResolver;

    #[test]
    fn test_state_mapping() {
        for state in [
            PipelineState::Null,
            PipelineState::Ready,
            PipelineState::Paused,
            PipelineState::Playing,
        ] {
            assert_eq!(from_gst_state(to_gst_state(state)), state);
        }
        assert_eq!(from_gst_state(gst::State::VoidPending), PipelineState::Null);
    }

    #[test]
    fn test_clock_conversion() {
        assert_eq!(
            clock_to_duration(Some(gst::ClockTime::from_mseconds(20))),
            Some(Duration::from_millis(20))
        );
        assert_eq!(clock_to_duration(None), None);
    }

    #[test]
    fn test_stage_lookup_follows_the_graph() {
        gst::init().unwrap();
        let pipeline = gst::parse::launch("fakesrc name=src ! fakesink name=out")
            .unwrap()
            .downcast::<gst::Pipeline>()
            .unwrap();
        let graph = GstGraph {
            pipeline: pipeline.clone(),
            bus_watch: Mutex::new(None),
        };

        assert_eq!(graph.stage("src").unwrap().name(), "src");

        let src = pipeline.by_name("src").unwrap();
        pipeline.remove(&src).unwrap();
        assert!(graph.stage("src").is_none());
        assert!(graph.stage("out").is_some());
    }

    fn request(session: u32, payload_type: u32) -> Vec<glib::Value> {
        vec![0u32.to_value(), session.to_value(), payload_type.to_value()]
    }

    fn resolver() -> PayloadMapHandler {
        let resolver = DynamicPayloadResolver::new();
        Arc::new(move |session, payload_type| resolver.on_payload_type_requested(session, payload_type))
    }

    #[test]
    fn test_unknown_payload_type_replies_null_caps() {
        gst::init().unwrap();

        let reply = payload_map_reply(&resolver(), &request(0, 37));
        assert_eq!(reply.get::<Option<gst::Caps>>().unwrap(), None);

        let reply = payload_map_reply(&resolver(), &request(0, 37)[..2]);
        assert_eq!(reply.get::<Option<gst::Caps>>().unwrap(), None);
    }

    #[test]
    fn test_known_payload_type_replies_caps() {
        gst::init().unwrap();

        let reply = payload_map_reply(&resolver(), &request(0, 96));
        let caps = reply.get::<Option<gst::Caps>>().unwrap().unwrap();
        let structure = caps.structure(0).unwrap();
        assert_eq!(structure.name().as_str(), "application/x-rtp");
        assert_eq!(structure.get::<&str>("encoding-name").unwrap(), "VP8");
        assert_eq!(structure.get::<i32>("payload").unwrap(), 96);
    }

    #[test]
    fn test_unanswered_aux_sender_replies_null_element() {
        gst::init().unwrap();
        let realised = Mutex::new(HashMap::new());
        let declined: AuxSenderHandler = Arc::new(|_| None);

        let reply = aux_sender_reply(&declined, &realised, &request(1, 0)[..2]);
        assert_eq!(reply.get::<Option<gst::Element>>().unwrap(), None);

        let reply = aux_sender_reply(&declined, &realised, &request(1, 0)[..1]);
        assert_eq!(reply.get::<Option<gst::Element>>().unwrap(), None);
        assert!(realised.lock().is_empty());
    }
}
