//! In-process engine
//!
//! A stand-in for a real media engine. It parses the same textual descriptions,
//! keeps named stages with property tables, and lets callers drive sinks,
//! sources, the session manager and the bus by hand. Bus messages and stats
//! notifications go through [`SimLoop`], so they are only delivered while the
//! loop is running or pumped.
//!
//! Engine memory is modelled as one reusable pool per sink which is overwritten
//! after every notification: a consumer that kept a reference instead of a copy
//! sees garbage.

use bytes::Bytes;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::{
    AuxSenderHandler, BufferView, BusEvent, BusHandler, EngineError, EngineGraph, EngineLoop,
    EngineSample, EngineStage, MediaEngine, PayloadMapHandler, PropertyValue,
    SessionManagerStage, SinkStage, SourceStage, StatsHandler, StatsRecord, UnitReadyHandler,
};
use crate::pipeline::state::PipelineState;
use crate::rtp::payload::CapabilityDescriptor;
use crate::rtp::retransmit::RetransmitStage;

/// Byte written over a sink's pool once a notification has been handled
pub const SCRIBBLE: u8 = 0xEE;

type Task = Box<dyn FnOnce() + Send>;

/// Event loop of the simulated engine
///
/// `quit` is sticky: a quit issued before `run` makes the next `run` return
/// immediately.
pub struct SimLoop {
    queue: Mutex<VecDeque<Task>>,
    wake: Condvar,
    running: AtomicBool,
    quit_requested: AtomicBool,
}

impl SimLoop {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            running: AtomicBool::new(false),
            quit_requested: AtomicBool::new(false),
        }
    }

    /// Queue a task for the loop thread
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.queue.lock().push_back(Box::new(task));
        self.wake.notify_all();
    }

    /// Run every queued task on the calling thread; returns how many ran
    pub fn pump(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = self.queue.lock().pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Tasks waiting to be dispatched
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

impl Default for SimLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineLoop for SimLoop {
    fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        let mut queue = self.queue.lock();
        loop {
            if self.quit_requested.swap(false, Ordering::SeqCst) {
                break;
            }
            match queue.pop_front() {
                Some(task) => MutexGuard::unlocked(&mut queue, task),
                None => self.wake.wait(&mut queue),
            }
        }
        drop(queue);
        self.running.store(false, Ordering::SeqCst);
    }

    fn quit(&self) {
        let _queue = self.queue.lock();
        self.quit_requested.store(true, Ordering::SeqCst);
        self.wake.notify_all();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Engine handing out simulated graphs
pub struct SimEngine {
    event_loop: Arc<SimLoop>,
    graphs: Mutex<Vec<Weak<SimGraph>>>,
}

impl SimEngine {
    pub fn new() -> Self {
        Self {
            event_loop: Arc::new(SimLoop::new()),
            graphs: Mutex::new(Vec::new()),
        }
    }

    /// The loop, typed, for pumping from tests
    pub fn sim_loop(&self) -> Arc<SimLoop> {
        self.event_loop.clone()
    }

    /// Graph built by the `index`-th launch, while something still holds it
    pub fn graph(&self, index: usize) -> Option<Arc<SimGraph>> {
        self.graphs.lock().get(index).and_then(Weak::upgrade)
    }

    /// Most recently launched graph
    pub fn latest(&self) -> Option<Arc<SimGraph>> {
        self.graphs.lock().last().and_then(Weak::upgrade)
    }

    pub fn launched(&self) -> usize {
        self.graphs.lock().len()
    }
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaEngine for SimEngine {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn launch(&self, description: &str) -> Result<Arc<dyn EngineGraph>, EngineError> {
        let specs = parse_description(description)?;
        let graph = Arc::new(SimGraph::build(description, specs, self.event_loop.clone())?);
        debug!(
            "SimEngine: launched graph with stages {:?}",
            graph.stage_names()
        );
        self.graphs.lock().push(Arc::downgrade(&graph));
        Ok(graph)
    }

    fn event_loop(&self) -> Arc<dyn EngineLoop> {
        self.event_loop.clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct StageSpec {
    factory: String,
    name: Option<String>,
    properties: Vec<(String, String)>,
}

enum Token<'a> {
    Link,
    Property(&'a str, &'a str),
    PadRef,
    Caps,
    Element(&'a str),
}

fn tokenize(description: &str) -> Result<Vec<String>, EngineError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for c in description.chars() {
        match c {
            '"' => quoted = !quoted,
            '!' if !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                tokens.push("!".to_string());
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }

    if quoted {
        return Err(EngineError::Parse("unterminated quote".into()));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn classify(token: &str) -> Token<'_> {
    if token == "!" {
        return Token::Link;
    }
    let eq = token.find('=');
    let slash = token.find('/');
    match (eq, slash) {
        (None, Some(_)) => Token::Caps,
        (Some(eq), Some(slash)) if slash < eq => Token::Caps,
        (Some(eq), _) => Token::Property(&token[..eq], &token[eq + 1..]),
        (None, None) if token.contains('.') => Token::PadRef,
        (None, None) => Token::Element(token),
    }
}

fn parse_description(description: &str) -> Result<Vec<StageSpec>, EngineError> {
    let tokens = tokenize(description)?;
    if tokens.is_empty() {
        return Err(EngineError::Parse("empty description".into()));
    }

    let mut specs: Vec<StageSpec> = Vec::new();
    let mut current: Option<usize> = None;
    let mut have_left = false;
    let mut after_link = false;

    for token in &tokens {
        match classify(token) {
            Token::Link => {
                if !have_left || after_link {
                    return Err(EngineError::Parse("`!` without a stage on its left".into()));
                }
                after_link = true;
                current = None;
            }
            Token::Property(key, value) => {
                let Some(index) = current else {
                    return Err(EngineError::Parse(format!(
                        "property `{}` outside of a stage",
                        key
                    )));
                };
                if key == "name" {
                    if value.is_empty() {
                        return Err(EngineError::Parse("empty stage name".into()));
                    }
                    specs[index].name = Some(value.to_string());
                } else {
                    specs[index].properties.push((key.to_string(), value.to_string()));
                }
            }
            Token::Caps | Token::PadRef => {
                current = None;
                have_left = true;
                after_link = false;
            }
            Token::Element(factory) => {
                specs.push(StageSpec {
                    factory: factory.to_string(),
                    name: None,
                    properties: Vec::new(),
                });
                current = Some(specs.len() - 1);
                have_left = true;
                after_link = false;
            }
        }
    }

    if after_link {
        return Err(EngineError::Parse("description ends with `!`".into()));
    }

    // Unnamed stages get `<factory><n>`, counted per factory
    let mut counters: HashMap<String, usize> = HashMap::new();
    for spec in specs.iter_mut().filter(|spec| spec.name.is_none()) {
        let counter = counters.entry(spec.factory.clone()).or_default();
        spec.name = Some(format!("{}{}", spec.factory, counter));
        *counter += 1;
    }

    let mut seen = std::collections::HashSet::new();
    for spec in &specs {
        if let Some(name) = &spec.name {
            if !seen.insert(name.as_str()) {
                return Err(EngineError::Parse(format!("duplicate stage name `{}`", name)));
            }
        }
    }

    Ok(specs)
}

fn parse_literal(value: &str) -> PropertyValue {
    if let Ok(v) = value.parse::<u64>() {
        PropertyValue::UInt(v)
    } else if let Ok(v) = value.parse::<i64>() {
        PropertyValue::Int(v)
    } else {
        match value {
            "true" => PropertyValue::Bool(true),
            "false" => PropertyValue::Bool(false),
            _ => PropertyValue::Str(value.to_string()),
        }
    }
}

/// Properties of the factories the simulator knows; others accept anything
fn known_properties(factory: &str) -> Option<&'static [&'static str]> {
    let known: &'static [&'static str] = match factory {
        "appsink" => &["emit-signals", "sync", "drop", "max-buffers", "async", "caps"],
        "appsrc" => &["is-live", "format", "do-timestamp", "caps", "max-bytes"],
        "rtpbin" => &[
            "latency",
            "rtp-profile",
            "sdes",
            "do-retransmission",
            "add-reference-timestamp-meta",
        ],
        "vp8enc" | "vp9enc" => &[
            "target-bitrate",
            "deadline",
            "cpu-used",
            "keyframe-max-dist",
            "end-usage",
            "error-resilient",
            "auto-alt-ref",
            "threads",
        ],
        "x264enc" | "x265enc" => &["bitrate", "tune", "speed-preset", "key-int-max"],
        "opusenc" => &[
            "bitrate",
            "packet-loss-percentage",
            "inband-fec",
            "audio-type",
            "frame-size",
        ],
        _ => return None,
    };
    Some(known)
}

struct Shared {
    state: Mutex<PipelineState>,
    bus: Mutex<Option<BusHandler>>,
}

impl Shared {
    fn state(&self) -> PipelineState {
        *self.state.lock()
    }
}

/// Timing of the unit sitting in a sink's pool
#[derive(Clone, Copy)]
struct PendingUnit {
    duration: Option<Duration>,
    pts: Option<Duration>,
}

/// Simulated `appsink`
pub struct SimSink {
    shared: Arc<Shared>,
    emit_signals: AtomicBool,
    handlers: Mutex<Vec<UnitReadyHandler>>,
    pool: Arc<Mutex<Vec<u8>>>,
    pending: Mutex<Option<PendingUnit>>,
    outstanding: Arc<AtomicUsize>,
}

impl SimSink {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            emit_signals: AtomicBool::new(false),
            handlers: Mutex::new(Vec::new()),
            pool: Arc::new(Mutex::new(Vec::new())),
            pending: Mutex::new(None),
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn notify(&self) {
        let handlers = self.handlers.lock().clone();
        for handler in handlers {
            handler(self);
        }
    }
}

impl SinkStage for SimSink {
    fn enable_unit_ready(&self) -> Result<(), EngineError> {
        self.emit_signals.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn connect_unit_ready(&self, handler: UnitReadyHandler) -> Result<(), EngineError> {
        self.handlers.lock().push(handler);
        Ok(())
    }

    fn pull_sample(&self) -> Option<Box<dyn EngineSample>> {
        let pending = self.pending.lock().take()?;
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Some(Box::new(SimSample {
            pool: self.pool.clone(),
            timing: pending,
            outstanding: self.outstanding.clone(),
        }))
    }
}

struct SimSample {
    pool: Arc<Mutex<Vec<u8>>>,
    timing: PendingUnit,
    outstanding: Arc<AtomicUsize>,
}

struct PoolGuard<'a>(MutexGuard<'a, Vec<u8>>);

impl AsRef<[u8]> for PoolGuard<'_> {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl EngineSample for SimSample {
    fn buffer(&self) -> Option<BufferView<'_>> {
        Some(BufferView::new(
            PoolGuard(self.pool.lock()),
            self.timing.duration,
            self.timing.pts,
        ))
    }
}

impl Drop for SimSample {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Simulated `appsrc`
pub struct SimSource {
    name: String,
    shared: Arc<Shared>,
    pushed: Mutex<Vec<Bytes>>,
    failing: AtomicBool,
}

impl SourceStage for SimSource {
    fn push_buffer(&self, data: Bytes) -> Result<(), EngineError> {
        if self.failing.load(Ordering::SeqCst) || self.shared.state().is_null() {
            return Err(EngineError::Push {
                stage: self.name.clone(),
                reason: "flushing".into(),
            });
        }
        trace!("SimSource: {} accepted {} bytes", self.name, data.len());
        self.pushed.lock().push(data);
        Ok(())
    }
}

/// Simulated `rtpbin`
#[derive(Default)]
pub struct SimSessionManager {
    aux_sender: Mutex<Option<AuxSenderHandler>>,
    payload_map: Mutex<Option<PayloadMapHandler>>,
    stats: Mutex<Vec<StatsHandler>>,
}

impl SessionManagerStage for SimSessionManager {
    fn connect_aux_sender(&self, handler: AuxSenderHandler) -> Result<(), EngineError> {
        *self.aux_sender.lock() = Some(handler);
        Ok(())
    }

    fn connect_payload_map(&self, handler: PayloadMapHandler) -> Result<(), EngineError> {
        *self.payload_map.lock() = Some(handler);
        Ok(())
    }

    fn connect_stats(&self, handler: StatsHandler) -> Result<(), EngineError> {
        self.stats.lock().push(handler);
        Ok(())
    }
}

enum StageRole {
    Generic,
    Sink(SimSink),
    Source(SimSource),
    SessionManager(SimSessionManager),
}

/// A stage of a simulated graph
pub struct SimStage {
    name: String,
    factory: String,
    known: Option<&'static [&'static str]>,
    properties: Mutex<BTreeMap<String, PropertyValue>>,
    role: StageRole,
}

impl SimStage {
    fn new(spec: &StageSpec, shared: &Arc<Shared>) -> Result<Self, EngineError> {
        let name = spec.name.clone().unwrap_or_else(|| spec.factory.clone());
        let role = match spec.factory.as_str() {
            "appsink" => StageRole::Sink(SimSink::new(shared.clone())),
            "appsrc" => StageRole::Source(SimSource {
                name: name.clone(),
                shared: shared.clone(),
                pushed: Mutex::new(Vec::new()),
                failing: AtomicBool::new(false),
            }),
            "rtpbin" => StageRole::SessionManager(SimSessionManager::default()),
            _ => StageRole::Generic,
        };

        let stage = Self {
            name,
            factory: spec.factory.clone(),
            known: known_properties(&spec.factory),
            properties: Mutex::new(BTreeMap::new()),
            role,
        };
        for (key, value) in &spec.properties {
            stage
                .set_property(key, parse_literal(value))
                .map_err(|e| EngineError::Parse(e.to_string()))?;
        }
        Ok(stage)
    }

    pub fn property(&self, property: &str) -> Option<PropertyValue> {
        self.properties.lock().get(property).cloned()
    }
}

impl EngineStage for SimStage {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn factory(&self) -> String {
        self.factory.clone()
    }

    fn set_property(&self, property: &str, value: PropertyValue) -> Result<(), EngineError> {
        if let Some(known) = self.known {
            if !known.contains(&property) {
                return Err(EngineError::UnknownProperty {
                    stage: self.name.clone(),
                    property: property.to_string(),
                });
            }
        }
        if let (StageRole::Sink(sink), "emit-signals") = (&self.role, property) {
            sink.emit_signals
                .store(value == PropertyValue::Bool(true), Ordering::SeqCst);
        }
        trace!("SimStage: {}.{} = {}", self.name, property, value);
        self.properties.lock().insert(property.to_string(), value);
        Ok(())
    }

    fn as_sink(&self) -> Option<&dyn SinkStage> {
        match &self.role {
            StageRole::Sink(sink) => Some(sink),
            _ => None,
        }
    }

    fn as_source(&self) -> Option<&dyn SourceStage> {
        match &self.role {
            StageRole::Source(source) => Some(source),
            _ => None,
        }
    }

    fn as_session_manager(&self) -> Option<&dyn SessionManagerStage> {
        match &self.role {
            StageRole::SessionManager(manager) => Some(manager),
            _ => None,
        }
    }
}

/// A simulated graph plus the hooks to drive it
pub struct SimGraph {
    description: String,
    stages: Vec<Arc<SimStage>>,
    shared: Arc<Shared>,
    event_loop: Arc<SimLoop>,
    transitions: Mutex<Vec<PipelineState>>,
    fail_next: Mutex<Option<PipelineState>>,
}

impl SimGraph {
    fn build(
        description: &str,
        specs: Vec<StageSpec>,
        event_loop: Arc<SimLoop>,
    ) -> Result<Self, EngineError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(PipelineState::Null),
            bus: Mutex::new(None),
        });
        let stages = specs
            .iter()
            .map(|spec| SimStage::new(spec, &shared).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            description: description.to_string(),
            stages,
            shared,
            event_loop,
            transitions: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
        })
    }

    fn find(&self, name: &str) -> Result<&Arc<SimStage>, EngineError> {
        self.stages
            .iter()
            .find(|stage| stage.name == name)
            .ok_or_else(|| EngineError::Other(format!("no stage named `{}`", name)))
    }

    fn role_mismatch(name: &str, wanted: &str) -> EngineError {
        EngineError::Other(format!("stage `{}` is not {}", name, wanted))
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|stage| stage.name.clone()).collect()
    }

    pub fn property(&self, stage: &str, property: &str) -> Option<PropertyValue> {
        self.find(stage).ok()?.property(property)
    }

    /// Every state the graph was asked to enter, in order
    pub fn transitions(&self) -> Vec<PipelineState> {
        self.transitions.lock().clone()
    }

    /// Make the next request to enter `state` fail
    pub fn fail_next_transition(&self, state: PipelineState) {
        *self.fail_next.lock() = Some(state);
    }

    pub fn is_bus_watched(&self) -> bool {
        self.shared.bus.lock().is_some()
    }

    pub fn notifications_enabled(&self, sink: &str) -> bool {
        match self.find(sink).map(|stage| &stage.role) {
            Ok(StageRole::Sink(sink)) => sink.emit_signals.load(Ordering::SeqCst),
            _ => false,
        }
    }

    /// Samples pulled from `sink` that have not been released yet
    pub fn outstanding_samples(&self, sink: &str) -> usize {
        match self.find(sink).map(|stage| &stage.role) {
            Ok(StageRole::Sink(sink)) => sink.outstanding.load(Ordering::SeqCst),
            _ => 0,
        }
    }

    /// Complete a unit on `sink`'s streaming thread (the caller's)
    ///
    /// Returns whether a notification went out. Nothing is delivered unless the
    /// graph is playing and the sink emits notifications. The sink's pool is
    /// overwritten with [`SCRIBBLE`] once the handlers return.
    pub fn produce(
        &self,
        sink: &str,
        data: &[u8],
        duration: Option<Duration>,
        pts: Option<Duration>,
    ) -> Result<bool, EngineError> {
        let stage = self.find(sink)?;
        let StageRole::Sink(sim_sink) = &stage.role else {
            return Err(Self::role_mismatch(sink, "an appsink"));
        };

        if !self.shared.state().is_playing() || !sim_sink.emit_signals.load(Ordering::SeqCst) {
            return Ok(false);
        }

        {
            let mut pool = sim_sink.pool.lock();
            pool.clear();
            pool.extend_from_slice(data);
        }
        *sim_sink.pending.lock() = Some(PendingUnit { duration, pts });

        sim_sink.notify();

        sim_sink.pending.lock().take();
        sim_sink.pool.lock().fill(SCRIBBLE);
        Ok(true)
    }

    /// Fire a notification with nothing to pull
    pub fn notify_empty(&self, sink: &str) -> Result<(), EngineError> {
        let stage = self.find(sink)?;
        let StageRole::Sink(sim_sink) = &stage.role else {
            return Err(Self::role_mismatch(sink, "an appsink"));
        };
        sim_sink.notify();
        Ok(())
    }

    /// Buffers accepted by an `appsrc`
    pub fn pushed(&self, source: &str) -> Vec<Bytes> {
        match self.find(source).map(|stage| &stage.role) {
            Ok(StageRole::Source(source)) => source.pushed.lock().clone(),
            _ => Vec::new(),
        }
    }

    pub fn set_source_failing(&self, source: &str, failing: bool) -> Result<(), EngineError> {
        let stage = self.find(source)?;
        let StageRole::Source(sim_source) = &stage.role else {
            return Err(Self::role_mismatch(source, "an appsrc"));
        };
        sim_source.failing.store(failing, Ordering::SeqCst);
        Ok(())
    }

    fn session_manager(&self) -> Option<&SimSessionManager> {
        self.stages.iter().find_map(|stage| match &stage.role {
            StageRole::SessionManager(manager) => Some(manager),
            _ => None,
        })
    }

    /// Emit `request-aux-sender` synchronously, as the engine does while linking
    pub fn request_aux_sender(&self, session_id: u32) -> Option<Arc<RetransmitStage>> {
        let handler = self.session_manager()?.aux_sender.lock().clone()?;
        handler(session_id)
    }

    /// Emit `request-pt-map` synchronously
    pub fn request_pt_map(&self, session_id: u32, payload_type: u32) -> Option<CapabilityDescriptor> {
        let handler = self.session_manager()?.payload_map.lock().clone()?;
        handler(session_id, payload_type)
    }

    /// Publish a stats snapshot; delivered from the event loop
    pub fn emit_stats(&self, record: StatsRecord) {
        let Some(manager) = self.session_manager() else {
            return;
        };
        let handlers = manager.stats.lock().clone();
        self.event_loop.post(move || {
            for handler in handlers {
                handler(&record);
            }
        });
    }

    fn post_bus(&self, event: BusEvent) {
        let shared = Arc::downgrade(&self.shared);
        self.event_loop.post(move || {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let handler = shared.bus.lock().clone();
            if let Some(handler) = handler {
                handler(event);
            }
        });
    }

    /// Post end-of-stream on the bus
    pub fn post_eos(&self) {
        self.post_bus(BusEvent::EndOfStream);
    }

    /// Post an error on the bus
    pub fn post_error(&self, message: &str, debug: Option<&str>) {
        self.post_bus(BusEvent::Error {
            message: message.to_string(),
            debug: debug.map(str::to_string),
        });
    }

    pub fn post_warning(&self, message: &str) {
        self.post_bus(BusEvent::Warning {
            message: message.to_string(),
        });
    }
}

impl EngineGraph for SimGraph {
    fn stage(&self, name: &str) -> Option<Arc<dyn EngineStage>> {
        self.stages
            .iter()
            .find(|stage| stage.name == name)
            .map(|stage| stage.clone() as Arc<dyn EngineStage>)
    }

    fn set_state(&self, state: PipelineState) -> Result<(), EngineError> {
        {
            let mut fail_next = self.fail_next.lock();
            if *fail_next == Some(state) {
                *fail_next = None;
                return Err(EngineError::StateChange {
                    target: state,
                    reason: "simulated failure".into(),
                });
            }
        }
        self.transitions.lock().push(state);
        *self.shared.state.lock() = state;
        Ok(())
    }

    fn current_state(&self) -> PipelineState {
        self.shared.state()
    }

    fn watch_bus(&self, handler: BusHandler) -> Result<(), EngineError> {
        let mut bus = self.shared.bus.lock();
        if bus.is_some() {
            return Err(EngineError::Other("bus already has a watch".into()));
        }
        *bus = Some(handler);
        Ok(())
    }

    fn unwatch_bus(&self) {
        self.shared.bus.lock().take();
    }
}
