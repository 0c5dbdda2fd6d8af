//! Pipeline lifecycle: create, wire, start and stop
//!
//! A [`Pipeline`] owns its engine graph, the consumer bound at start, the
//! retransmission stages created for its sessions and its health counters.
//! Nothing is registered globally: every engine handler installed by `start`
//! captures exactly the pieces of one pipeline it needs.
//!
//! Stop releases the graph. In-flight relay notifications that already pulled
//! their unit may still reach the consumer while stop is running; notifications
//! that had not started yet are abandoned.

use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{BridgeConfig, SinkBinding};
use crate::engine::{BusEvent, BusHandler, EngineGraph, EngineStage, MediaEngine, StatsRecord};
use crate::error::{BridgeError, Result, TerminalEvent};
use crate::pipeline::health::RelayHealth;
use crate::pipeline::main_loop::MainLoop;
use crate::pipeline::state::PipelineState;
use crate::pipeline::types::PipelineId;
use crate::relay::BufferRelay;
use crate::relay::consumer::{PipelineConsumer, UnitOrigin};
use crate::rtp::feedback::{FeedbackInjector, FeedbackReport};
use crate::rtp::payload::DynamicPayloadResolver;
use crate::rtp::retransmit::RetransmissionStageFactory;
use crate::rtp::stats::StatsAggregator;

/// What `start` bound, and what it tolerated being absent
#[derive(Debug, Default)]
pub struct WiringReport {
    /// Sinks with a relay attached, in wiring order
    pub bound_sinks: Vec<String>,
    /// Whether the session manager hooks were installed
    pub session_manager: bool,
    /// Optional stages that were not present
    pub tolerated: Vec<BridgeError>,
}

/// Handle to one engine graph and everything wired to it
pub struct Pipeline {
    id: PipelineId,
    description: String,
    config: BridgeConfig,
    graph: RwLock<Option<Arc<dyn EngineGraph>>>,
    // Serialises start and stop
    lifecycle: Mutex<()>,
    state: Mutex<PipelineState>,
    consumer: Mutex<Option<Arc<dyn PipelineConsumer>>>,
    health: Arc<RelayHealth>,
    retransmit: Arc<RetransmissionStageFactory>,
    feedback: FeedbackInjector,
    terminal: Arc<Mutex<Option<TerminalEvent>>>,
}

impl Pipeline {
    fn new(id: PipelineId, description: &str, config: BridgeConfig, graph: Arc<dyn EngineGraph>) -> Self {
        let health = Arc::new(RelayHealth::new());
        Self {
            id,
            description: description.to_string(),
            retransmit: Arc::new(RetransmissionStageFactory::new(
                config.retransmit_payload_map.clone(),
            )),
            feedback: FeedbackInjector::new(config.feedback_sources.clone(), health.clone()),
            config,
            graph: RwLock::new(Some(graph)),
            lifecycle: Mutex::new(()),
            state: Mutex::new(PipelineState::Null),
            consumer: Mutex::new(None),
            health,
            terminal: Arc::new(Mutex::new(None)),
        }
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    /// Whether the graph has been released by `stop`
    pub fn is_closed(&self) -> bool {
        self.graph.read().is_none()
    }

    pub fn health(&self) -> Arc<RelayHealth> {
        self.health.clone()
    }

    pub fn retransmit(&self) -> &Arc<RetransmissionStageFactory> {
        &self.retransmit
    }

    /// First terminal event the engine reported, if any
    pub fn terminal_event(&self) -> Option<TerminalEvent> {
        self.terminal.lock().clone()
    }

    /// Run `f` against the stage named `name`
    ///
    /// The stage is looked up afresh on every call and never kept. `None` when
    /// the stage is absent or the pipeline has been stopped.
    pub fn with_stage<R>(&self, name: &str, f: impl FnOnce(&dyn EngineStage) -> R) -> Option<R> {
        let graph = self.graph.read();
        let stage = graph.as_ref()?.stage(name)?;
        Some(f(stage.as_ref()))
    }

    /// Inject externally received transport feedback at every ingestion point
    pub fn push_transport_feedback(&self, data: impl Into<Bytes>) -> FeedbackReport {
        let graph = self.graph.read();
        let report = self.feedback.push(graph.as_deref(), data.into());
        trace!("Pipeline {}: feedback {}", self.id, report);
        report
    }

    fn graph(&self) -> Option<Arc<dyn EngineGraph>> {
        self.graph.read().clone()
    }

    fn set_state(&self, state: PipelineState) {
        *self.state.lock() = state;
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Turns bus messages into terminal notifications for one pipeline
///
/// Only the first terminal event is kept and surfaced.
fn terminal_watch(
    id: PipelineId,
    consumer: Arc<dyn PipelineConsumer>,
    slot: Arc<Mutex<Option<TerminalEvent>>>,
) -> BusHandler {
    Arc::new(move |event: BusEvent| {
        let terminal = match event {
            BusEvent::EndOfStream => TerminalEvent::EndOfStream,
            BusEvent::Error { message, debug } => TerminalEvent::Fatal { message, debug },
            BusEvent::Warning { message } => {
                warn!("Pipeline {}: engine warning: {}", id, message);
                return;
            }
            BusEvent::Other(kind) => {
                trace!("Pipeline {}: bus message {}", id, kind);
                return;
            }
        };

        {
            let mut slot = slot.lock();
            if slot.is_some() {
                debug!("Pipeline {}: ignoring further terminal event {}", id, terminal);
                return;
            }
            *slot = Some(terminal.clone());
        }

        error!("Pipeline {}: {}", id, terminal);
        consumer.on_terminal(id, &terminal);
    })
}

/// Builds pipelines from descriptions and drives their lifecycle
pub struct PipelineLifecycleManager {
    engine: Arc<dyn MediaEngine>,
    config: BridgeConfig,
    resolver: DynamicPayloadResolver,
    next_id: AtomicU64,
    main_loop: MainLoop,
}

impl PipelineLifecycleManager {
    pub fn new(engine: Arc<dyn MediaEngine>, config: BridgeConfig) -> Self {
        let main_loop = MainLoop::new(engine.event_loop());
        Self {
            engine,
            config,
            resolver: DynamicPayloadResolver::new(),
            next_id: AtomicU64::new(1),
            main_loop,
        }
    }

    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Build a pipeline from `description` without starting it
    pub fn create(&self, description: &str) -> Result<Arc<Pipeline>> {
        if description.trim().is_empty() {
            return Err(BridgeError::Configuration("empty description".into()));
        }

        let graph = self
            .engine
            .launch(description)
            .map_err(|e| BridgeError::Configuration(e.to_string()))?;

        let id = PipelineId(self.next_id.fetch_add(1, Ordering::Relaxed));
        info!("Lifecycle: created pipeline {} on {} engine", id, self.engine.name());
        Ok(Arc::new(Pipeline::new(id, description, self.config.clone(), graph)))
    }

    /// Wire `consumer` to the pipeline's named stages and bring it to Playing
    ///
    /// Mandatory sinks are checked before anything is wired. A failure after
    /// that point releases the graph: the pipeline is closed and a new one has
    /// to be created.
    pub fn start(&self, pipeline: &Pipeline, consumer: Arc<dyn PipelineConsumer>) -> Result<WiringReport> {
        let _lifecycle = pipeline.lifecycle.lock();

        let graph = pipeline.graph().ok_or(BridgeError::Closed(pipeline.id))?;
        let from = pipeline.state();
        if !from.is_null() {
            return Err(BridgeError::InvalidTransition {
                from,
                to: PipelineState::Playing,
            });
        }

        for binding in pipeline.config.mandatory_sinks() {
            let present = graph
                .stage(&binding.name)
                .is_some_and(|stage| stage.as_sink().is_some());
            if !present {
                error!("Lifecycle: pipeline {} has no sink `{}`", pipeline.id, binding.name);
                return Err(BridgeError::Wiring {
                    stage: binding.name.clone(),
                });
            }
        }

        match self.wire(pipeline, graph.as_ref(), consumer) {
            Ok(report) => {
                info!(
                    "Lifecycle: pipeline {} playing, relaying {:?}",
                    pipeline.id, report.bound_sinks
                );
                Ok(report)
            }
            Err(e) => {
                error!("Lifecycle: pipeline {} failed to start: {}", pipeline.id, e);
                if let Err(release) = Self::release(pipeline) {
                    warn!("Lifecycle: pipeline {} release failed: {}", pipeline.id, release);
                }
                Err(e)
            }
        }
    }

    fn wire(
        &self,
        pipeline: &Pipeline,
        graph: &dyn EngineGraph,
        consumer: Arc<dyn PipelineConsumer>,
    ) -> Result<WiringReport> {
        let mut report = WiringReport::default();
        *pipeline.consumer.lock() = Some(consumer.clone());

        // Terminal events first, so nothing the engine reports while wiring is lost
        graph.watch_bus(terminal_watch(
            pipeline.id,
            consumer.clone(),
            pipeline.terminal.clone(),
        ))?;

        for binding in &pipeline.config.sinks {
            match self.bind_sink(pipeline, graph, binding, &consumer)? {
                true => report.bound_sinks.push(binding.name.clone()),
                false => {
                    info!(
                        "Lifecycle: pipeline {} optional sink `{}` absent",
                        pipeline.id, binding.name
                    );
                    report
                        .tolerated
                        .push(BridgeError::MissingOptionalStage(binding.name.clone()));
                }
            }
        }

        report.session_manager = self.bind_session_manager(pipeline, graph, &consumer)?;
        if !report.session_manager {
            info!(
                "Lifecycle: pipeline {} has no session manager `{}`",
                pipeline.id, pipeline.config.session_manager
            );
            report.tolerated.push(BridgeError::MissingOptionalStage(
                pipeline.config.session_manager.clone(),
            ));
        }

        for step in pipeline.state().upward_path(PipelineState::Playing).unwrap_or_default() {
            graph.set_state(step)?;
            pipeline.set_state(step);
            debug!("Lifecycle: pipeline {} -> {}", pipeline.id, step);
        }

        Ok(report)
    }

    fn bind_sink(
        &self,
        pipeline: &Pipeline,
        graph: &dyn EngineGraph,
        binding: &SinkBinding,
        consumer: &Arc<dyn PipelineConsumer>,
    ) -> Result<bool> {
        let Some(stage) = graph.stage(&binding.name) else {
            return Ok(false);
        };
        let Some(sink) = stage.as_sink() else {
            warn!(
                "Lifecycle: stage `{}` ({}) is not a sink",
                binding.name,
                stage.factory()
            );
            return Ok(false);
        };

        let relay = Arc::new(BufferRelay::new(
            UnitOrigin {
                pipeline: pipeline.id,
                sink: Arc::from(binding.name.as_str()),
                kind: binding.kind,
            },
            consumer.clone(),
            pipeline.health.clone(),
        ));
        sink.enable_unit_ready()?;
        sink.connect_unit_ready(relay.into_handler())?;
        Ok(true)
    }

    fn bind_session_manager(
        &self,
        pipeline: &Pipeline,
        graph: &dyn EngineGraph,
        consumer: &Arc<dyn PipelineConsumer>,
    ) -> Result<bool> {
        let Some(stage) = graph.stage(&pipeline.config.session_manager) else {
            return Ok(false);
        };
        let Some(manager) = stage.as_session_manager() else {
            return Ok(false);
        };

        let factory = pipeline.retransmit.clone();
        manager.connect_aux_sender(Arc::new(move |session_id: u32| {
            Some(factory.on_auxiliary_sender_requested(session_id))
        }))?;

        let resolver = self.resolver;
        manager.connect_payload_map(Arc::new(move |session_id: u32, payload_type: u32| {
            resolver.on_payload_type_requested(session_id, payload_type)
        }))?;

        let stats = StatsAggregator::new(pipeline.id, consumer.clone(), pipeline.health.clone());
        manager.connect_stats(Arc::new(move |record: &StatsRecord| {
            stats.on_stats_notification(record);
        }))?;

        Ok(true)
    }

    /// Bring the pipeline to Null and release its graph
    ///
    /// Idempotent: stopping a stopped pipeline succeeds and does nothing.
    pub fn stop(&self, pipeline: &Pipeline) -> Result<()> {
        let _lifecycle = pipeline.lifecycle.lock();
        if pipeline.is_closed() {
            debug!("Lifecycle: pipeline {} already stopped", pipeline.id);
            return Ok(());
        }

        info!(
            "Lifecycle: stopping pipeline {} ({})",
            pipeline.id,
            pipeline.health.summary()
        );
        Self::release(pipeline)
    }

    fn release(pipeline: &Pipeline) -> Result<()> {
        // Taken out under the lock, torn down outside it: the Null transition
        // joins streaming threads that may be inside the controller
        let graph = pipeline.graph.write().take();
        let Some(graph) = graph else {
            return Ok(());
        };

        graph.unwatch_bus();
        let result = graph.set_state(PipelineState::Null);
        pipeline.set_state(PipelineState::Null);
        pipeline.consumer.lock().take();
        drop(graph);

        result.map_err(BridgeError::from)
    }

    /// The engine's event loop; every handle shares one quit flag
    pub fn main_loop(&self) -> MainLoop {
        self.main_loop.clone()
    }

    /// Pump engine events on the calling thread until the loop is quit
    pub fn main_loop_run(&self) {
        self.main_loop.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sim::{SCRIBBLE, SimEngine, SimGraph};
    use crate::engine::{EngineError, FieldValue, PropertyValue};
    use crate::pipeline::types::{DataUnit, MediaKind, StatsSample};
    use crate::rtp::stats;
    use std::time::Duration;

    const SENDER: &str = "videotestsrc is-live=true ! vp8enc name=videoencoder target-bitrate=1000000 deadline=1 ! \
        rtpvp8pay pt=96 ! rtpbin.send_rtp_sink_0 \
        rtpbin name=rtpbin rtpbin.send_rtp_src_0 ! appsink name=rtpsink \
        rtpbin.send_rtcp_src_0 ! appsink name=rtcpsink \
        appsrc name=rtcpsrc0 ! rtpbin.recv_rtcp_sink_0 \
        appsrc name=rtcpsrc1 ! rtpbin.recv_rtcp_sink_1";

    const NO_SESSION_MANAGER: &str = "videotestsrc ! vp8enc name=videoencoder ! rtpvp8pay ! appsink name=rtpsink \
        audiotestsrc ! opusenc ! rtpopuspay ! appsink name=rtcpsink";

    #[derive(Default)]
    struct Recorder {
        units: Mutex<Vec<(UnitOrigin, DataUnit)>>,
        stats: Mutex<Vec<StatsSample>>,
        terminal: Mutex<Vec<TerminalEvent>>,
    }

    impl PipelineConsumer for Recorder {
        fn on_data_unit(&self, origin: &UnitOrigin, unit: DataUnit) {
            self.units.lock().push((origin.clone(), unit));
        }

        fn on_stats(&self, _pipeline: PipelineId, sample: StatsSample) {
            self.stats.lock().push(sample);
        }

        fn on_terminal(&self, _pipeline: PipelineId, event: &TerminalEvent) {
            self.terminal.lock().push(event.clone());
        }
    }

    struct Fixture {
        engine: Arc<SimEngine>,
        manager: PipelineLifecycleManager,
    }

    impl Fixture {
        fn new(config: BridgeConfig) -> Self {
            let engine = Arc::new(SimEngine::new());
            let manager = PipelineLifecycleManager::new(engine.clone(), config);
            Self { engine, manager }
        }

        fn create(&self, description: &str) -> (Arc<Pipeline>, Arc<SimGraph>) {
            let pipeline = self.manager.create(description).unwrap();
            (pipeline, self.engine.latest().unwrap())
        }
    }

    fn twcc_record() -> StatsRecord {
        StatsRecord::new("RTPTWCCStats")
            .with(stats::BITRATE_SENT, FieldValue::UInt(800_000))
            .with(stats::BITRATE_RECV, FieldValue::UInt(780_000))
            .with(stats::PACKETS_SENT, FieldValue::UInt(120))
            .with(stats::PACKETS_RECV, FieldValue::UInt(118))
            .with(stats::AVG_DELTA_OF_DELTA, FieldValue::Int(42))
    }

    #[test]
    fn test_start_walks_to_playing_and_stop_is_idempotent() {
        let fixture = Fixture::new(BridgeConfig::rtp_sender());
        let (pipeline, graph) = fixture.create(SENDER);
        assert_eq!(pipeline.state(), PipelineState::Null);

        let report = fixture
            .manager
            .start(&pipeline, Arc::new(Recorder::default()))
            .unwrap();

        assert_eq!(report.bound_sinks, vec!["rtpsink", "rtcpsink"]);
        assert!(report.session_manager);
        assert!(report.tolerated.is_empty());
        assert_eq!(pipeline.state(), PipelineState::Playing);
        assert_eq!(
            graph.transitions(),
            vec![PipelineState::Ready, PipelineState::Paused, PipelineState::Playing]
        );
        assert!(graph.notifications_enabled("rtpsink"));
        assert!(graph.is_bus_watched());

        fixture.manager.stop(&pipeline).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Null);
        assert_eq!(graph.current_state(), PipelineState::Null);
        assert!(!graph.is_bus_watched());
        assert!(pipeline.is_closed());

        fixture.manager.stop(&pipeline).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Null);
        assert_eq!(graph.transitions().len(), 4);
    }

    #[test]
    fn test_stop_releases_the_graph() {
        let fixture = Fixture::new(BridgeConfig::rtp_sender());
        let (pipeline, graph) = fixture.create(SENDER);
        fixture.manager.start(&pipeline, Arc::new(Recorder::default())).unwrap();

        fixture.manager.stop(&pipeline).unwrap();
        assert_eq!(Arc::strong_count(&graph), 1);
        drop(graph);
        assert!(fixture.engine.latest().is_none());
    }

    #[test]
    fn test_malformed_description_is_a_configuration_error() {
        let fixture = Fixture::new(BridgeConfig::rtp_sender());
        for description in ["", "   ", "videotestsrc ! ! appsink", "appsink name=\"rtpsink"] {
            assert!(
                matches!(fixture.manager.create(description), Err(BridgeError::Configuration(_))),
                "{:?}",
                description
            );
        }
    }

    #[test]
    fn test_missing_mandatory_sink_fails_without_wiring() {
        let fixture = Fixture::new(BridgeConfig::rtp_sender());
        let (pipeline, graph) = fixture.create("videotestsrc ! vp8enc ! appsink name=rtcpsink");

        let err = fixture
            .manager
            .start(&pipeline, Arc::new(Recorder::default()))
            .unwrap_err();

        assert!(matches!(err, BridgeError::Wiring { ref stage } if stage == "rtpsink"));
        assert!(!graph.is_bus_watched());
        assert!(!graph.notifications_enabled("rtcpsink"));
        assert!(graph.transitions().is_empty());
        assert_eq!(pipeline.state(), PipelineState::Null);
    }

    #[test]
    fn test_mandatory_name_on_a_non_sink_is_a_wiring_error() {
        let fixture = Fixture::new(BridgeConfig::rtp_sender());
        let (pipeline, _graph) = fixture.create("videotestsrc ! fakesink name=rtpsink");

        assert!(matches!(
            fixture.manager.start(&pipeline, Arc::new(Recorder::default())),
            Err(BridgeError::Wiring { .. })
        ));
    }

    #[test]
    fn test_absent_session_manager_is_tolerated() {
        let fixture = Fixture::new(BridgeConfig::rtp_sender());
        let (pipeline, graph) = fixture.create(NO_SESSION_MANAGER);
        let recorder = Arc::new(Recorder::default());

        let report = fixture.manager.start(&pipeline, recorder.clone()).unwrap();

        assert!(!report.session_manager);
        assert!(matches!(
            report.tolerated.as_slice(),
            [BridgeError::MissingOptionalStage(name)] if name == "rtpbin"
        ));
        assert_eq!(pipeline.state(), PipelineState::Playing);

        graph.produce("rtpsink", &[0x80, 0x60, 0, 1], None, None).unwrap();
        let units = recorder.units.lock();
        assert_eq!(units.len(), 1);
        assert_eq!(&*units[0].0.sink, "rtpsink");
    }

    #[test]
    fn test_optional_sinks_are_tolerated() {
        let fixture = Fixture::new(BridgeConfig::media_sinks());
        let (pipeline, graph) = fixture.create("videotestsrc ! vp8enc name=video_encode ! appsink name=video_sink");
        let recorder = Arc::new(Recorder::default());

        let report = fixture.manager.start(&pipeline, recorder.clone()).unwrap();
        assert_eq!(report.bound_sinks, vec!["video_sink"]);
        assert_eq!(report.tolerated.len(), 2);

        graph.produce("video_sink", &[1, 2, 3], None, None).unwrap();
        assert_eq!(recorder.units.lock()[0].0.kind, Some(MediaKind::Video));
    }

    #[test]
    fn test_relay_hands_out_independent_copies() {
        let fixture = Fixture::new(BridgeConfig::rtp_sender());
        let (pipeline, graph) = fixture.create(SENDER);
        let recorder = Arc::new(Recorder::default());
        fixture.manager.start(&pipeline, recorder.clone()).unwrap();

        let payload: Vec<u8> = (0..=255).collect();
        graph
            .produce(
                "rtpsink",
                &payload,
                Some(Duration::from_millis(33)),
                Some(Duration::from_millis(1_000)),
            )
            .unwrap();
        graph.produce("rtpsink", &[9; 16], None, None).unwrap();

        let units = recorder.units.lock();
        assert_eq!(units.len(), 2);
        assert_eq!(&units[0].1.data[..], &payload[..]);
        assert!(units[0].1.data.iter().any(|b| *b != SCRIBBLE));
        assert_eq!(units[0].1.duration, Some(Duration::from_millis(33)));
        assert_eq!(units[0].1.pts, Some(Duration::from_millis(1_000)));
        assert_eq!(&units[1].1.data[..], &[9; 16]);
        assert_eq!(pipeline.health().units_relayed(), 2);
        assert_eq!(pipeline.health().bytes_relayed(), 256 + 16);
    }

    #[test]
    fn test_sample_is_released_before_the_consumer_runs() {
        struct CheckReleased {
            graph: Mutex<Option<Arc<SimGraph>>>,
            outstanding: Mutex<Vec<usize>>,
        }

        impl PipelineConsumer for CheckReleased {
            fn on_data_unit(&self, origin: &UnitOrigin, _unit: DataUnit) {
                if let Some(graph) = self.graph.lock().as_ref() {
                    self.outstanding.lock().push(graph.outstanding_samples(&origin.sink));
                }
            }
        }

        let fixture = Fixture::new(BridgeConfig::rtp_sender());
        let (pipeline, graph) = fixture.create(SENDER);
        let consumer = Arc::new(CheckReleased {
            graph: Mutex::new(Some(graph.clone())),
            outstanding: Mutex::new(Vec::new()),
        });
        fixture.manager.start(&pipeline, consumer.clone()).unwrap();

        graph.produce("rtpsink", &[1; 4], None, None).unwrap();
        assert_eq!(*consumer.outstanding.lock(), vec![0]);
        consumer.graph.lock().take();
    }

    #[test]
    fn test_spurious_notification_is_silent() {
        let fixture = Fixture::new(BridgeConfig::rtp_sender());
        let (pipeline, graph) = fixture.create(SENDER);
        let recorder = Arc::new(Recorder::default());
        fixture.manager.start(&pipeline, recorder.clone()).unwrap();

        graph.notify_empty("rtpsink").unwrap();

        assert!(recorder.units.lock().is_empty());
        assert_eq!(pipeline.health().empty_notifications(), 1);
    }

    #[test]
    fn test_sinks_relay_concurrently_in_order() {
        let fixture = Fixture::new(BridgeConfig::rtp_sender());
        let (pipeline, graph) = fixture.create(SENDER);
        let recorder = Arc::new(Recorder::default());
        fixture.manager.start(&pipeline, recorder.clone()).unwrap();

        let threads: Vec<_> = ["rtpsink", "rtcpsink"]
            .into_iter()
            .map(|sink| {
                let graph = graph.clone();
                std::thread::spawn(move || {
                    for i in 0..100u8 {
                        graph.produce(sink, &[i], None, None).unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let units = recorder.units.lock();
        for sink in ["rtpsink", "rtcpsink"] {
            let order: Vec<u8> = units
                .iter()
                .filter(|(origin, _)| &*origin.sink == sink)
                .map(|(_, unit)| unit.data[0])
                .collect();
            assert_eq!(order, (0..100).collect::<Vec<u8>>());
        }
    }

    #[test]
    fn test_no_delivery_after_stop() {
        let fixture = Fixture::new(BridgeConfig::rtp_sender());
        let (pipeline, graph) = fixture.create(SENDER);
        let recorder = Arc::new(Recorder::default());
        fixture.manager.start(&pipeline, recorder.clone()).unwrap();
        fixture.manager.stop(&pipeline).unwrap();

        assert!(!graph.produce("rtpsink", &[1], None, None).unwrap());
        assert!(recorder.units.lock().is_empty());
    }

    #[test]
    fn test_terminal_events_reach_the_consumer_once() {
        let fixture = Fixture::new(BridgeConfig::rtp_sender());
        let (pipeline, graph) = fixture.create(SENDER);
        let recorder = Arc::new(Recorder::default());
        fixture.manager.start(&pipeline, recorder.clone()).unwrap();

        graph.post_warning("late frame");
        graph.post_error("Internal data stream error.", Some("streaming stopped, reason not-linked"));
        graph.post_eos();
        assert!(recorder.terminal.lock().is_empty());
        fixture.engine.sim_loop().pump();

        let expected = TerminalEvent::Fatal {
            message: "Internal data stream error.".into(),
            debug: Some("streaming stopped, reason not-linked".into()),
        };
        assert_eq!(*recorder.terminal.lock(), vec![expected.clone()]);
        assert_eq!(pipeline.terminal_event(), Some(expected));
    }

    #[test]
    fn test_terminal_event_after_stop_is_dropped() {
        let fixture = Fixture::new(BridgeConfig::rtp_sender());
        let (pipeline, graph) = fixture.create(SENDER);
        let recorder = Arc::new(Recorder::default());
        fixture.manager.start(&pipeline, recorder.clone()).unwrap();

        graph.post_eos();
        fixture.manager.stop(&pipeline).unwrap();
        fixture.engine.sim_loop().pump();

        assert!(recorder.terminal.lock().is_empty());
    }

    #[test]
    fn test_session_manager_hooks_are_wired() {
        let fixture = Fixture::new(BridgeConfig::rtp_sender());
        let (pipeline, graph) = fixture.create(SENDER);
        let recorder = Arc::new(Recorder::default());
        fixture.manager.start(&pipeline, recorder.clone()).unwrap();

        let first = graph.request_aux_sender(0).unwrap();
        let again = graph.request_aux_sender(0).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.src_pad(), "src_0");
        assert_eq!(pipeline.retransmit().session_count(), 1);

        let caps = graph.request_pt_map(0, 111).unwrap();
        assert_eq!((caps.media, caps.clock_rate), (MediaKind::Audio, 48_000));
        assert!(graph.request_pt_map(0, 37).is_none());

        graph.emit_stats(twcc_record());
        fixture.engine.sim_loop().pump();
        assert_eq!(recorder.stats.lock().len(), 1);
        assert_eq!(recorder.stats.lock()[0].avg_delta_of_delta, 42);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let fixture = Fixture::new(BridgeConfig::rtp_sender());
        let (pipeline, _graph) = fixture.create(SENDER);
        fixture.manager.start(&pipeline, Arc::new(Recorder::default())).unwrap();

        assert!(matches!(
            fixture.manager.start(&pipeline, Arc::new(Recorder::default())),
            Err(BridgeError::InvalidTransition {
                from: PipelineState::Playing,
                to: PipelineState::Playing
            })
        ));
    }

    #[test]
    fn test_start_after_stop_is_closed() {
        let fixture = Fixture::new(BridgeConfig::rtp_sender());
        let (pipeline, _graph) = fixture.create(SENDER);
        fixture.manager.stop(&pipeline).unwrap();

        assert!(matches!(
            fixture.manager.start(&pipeline, Arc::new(Recorder::default())),
            Err(BridgeError::Closed(id)) if id == pipeline.id()
        ));
    }

    #[test]
    fn test_failed_transition_releases_the_pipeline() {
        let fixture = Fixture::new(BridgeConfig::rtp_sender());
        let (pipeline, graph) = fixture.create(SENDER);
        graph.fail_next_transition(PipelineState::Paused);

        let err = fixture
            .manager
            .start(&pipeline, Arc::new(Recorder::default()))
            .unwrap_err();

        assert!(matches!(
            err,
            BridgeError::Engine(EngineError::StateChange { target: PipelineState::Paused, .. })
        ));
        assert!(pipeline.is_closed());
        assert_eq!(pipeline.state(), PipelineState::Null);
        assert_eq!(graph.current_state(), PipelineState::Null);
    }

    #[test]
    fn test_with_stage_is_nil_safe() {
        let fixture = Fixture::new(BridgeConfig::rtp_sender());
        let (pipeline, _graph) = fixture.create(SENDER);

        assert_eq!(pipeline.with_stage("videoencoder", |stage| stage.factory()).as_deref(), Some("vp8enc"));
        assert!(pipeline.with_stage("audioencode", |stage| stage.factory()).is_none());

        fixture.manager.stop(&pipeline).unwrap();
        assert!(pipeline.with_stage("videoencoder", |stage| stage.factory()).is_none());
    }

    #[test]
    fn test_feedback_fans_out_through_the_pipeline() {
        let fixture = Fixture::new(BridgeConfig::rtp_sender());
        let (pipeline, graph) = fixture.create(SENDER);
        fixture.manager.start(&pipeline, Arc::new(Recorder::default())).unwrap();
        graph.set_source_failing("rtcpsrc0", true).unwrap();

        let report = pipeline.push_transport_feedback(vec![0x81, 0xcd, 0x00, 0x01]);

        assert_eq!(report.delivered, vec!["rtcpsrc1"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(graph.pushed("rtcpsrc1").len(), 1);

        fixture.manager.stop(&pipeline).unwrap();
        let report = pipeline.push_transport_feedback(vec![0x81]);
        assert_eq!(report.absent, vec!["rtcpsrc0", "rtcpsrc1"]);
    }

    #[test]
    fn test_controller_runs_concurrently_with_stop() {
        let fixture = Fixture::new(BridgeConfig::rtp_sender());
        let (pipeline, graph) = fixture.create(SENDER);
        fixture.manager.start(&pipeline, Arc::new(Recorder::default())).unwrap();

        let writer = {
            let pipeline = pipeline.clone();
            std::thread::spawn(move || {
                for bitrate in 0..500u64 {
                    pipeline.with_stage("videoencoder", |stage| {
                        stage
                            .set_property("target-bitrate", PropertyValue::UInt(bitrate))
                            .unwrap()
                    });
                }
            })
        };
        fixture.manager.stop(&pipeline).unwrap();
        writer.join().unwrap();

        assert!(pipeline.is_closed());
        assert_eq!(graph.current_state(), PipelineState::Null);
    }

    #[test]
    fn test_quit_before_main_loop_run_returns() {
        let fixture = Fixture::new(BridgeConfig::rtp_sender());
        fixture.manager.main_loop().quit();

        fixture.manager.main_loop_run();
        assert!(fixture.manager.main_loop().quit_requested());
        assert!(!fixture.manager.main_loop().is_running());
    }

    #[test]
    fn test_main_loop_run_quits_from_another_thread() {
        let engine = Arc::new(SimEngine::new());
        let manager = Arc::new(PipelineLifecycleManager::new(engine.clone(), BridgeConfig::rtp_sender()));

        let runner = {
            let manager = manager.clone();
            std::thread::spawn(move || manager.main_loop_run())
        };

        let (tx, rx) = std::sync::mpsc::channel();
        engine.sim_loop().post(move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        manager.main_loop().quit();
        runner.join().unwrap();
        assert!(!manager.main_loop().is_running());
    }

    #[test]
    fn test_pipelines_get_distinct_ids() {
        let fixture = Fixture::new(BridgeConfig::rtp_sender());
        let (a, _) = fixture.create(SENDER);
        let (b, _) = fixture.create(SENDER);
        assert_ne!(a.id(), b.id());
    }
}
