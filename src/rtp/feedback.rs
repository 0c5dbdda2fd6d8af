//! External transport feedback injection
//!
//! Feedback received by the application (RTCP from the remote peer) enters the
//! graph through one or more source stages. Every ingestion point is pushed
//! independently: a point that is missing or refuses the buffer is recorded in
//! the report and the remaining points are still served.

use bytes::Bytes;
use log::{Level, debug, log_enabled, warn};
use rtcp::packet::Packet;
use std::sync::Arc;

use crate::engine::{EngineError, EngineGraph};
use crate::pipeline::health::RelayHealth;

/// Outcome of one feedback push, per ingestion point
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedbackReport {
    /// Points that accepted the buffer
    pub delivered: Vec<String>,
    /// Points that exist but refused it
    pub failed: Vec<(String, EngineError)>,
    /// Points not present in the graph
    pub absent: Vec<String>,
}

impl FeedbackReport {
    pub fn delivered_anywhere(&self) -> bool {
        !self.delivered.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.absent.is_empty()
    }
}

impl std::fmt::Display for FeedbackReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} delivered, {} failed, {} absent",
            self.delivered.len(),
            self.failed.len(),
            self.absent.len()
        )
    }
}

/// Short description of the RTCP packets in `data`, for logs
///
/// The payload stays opaque to the bridge: `None` only means it could not be
/// parsed, never that it will not be pushed.
pub fn describe(data: &[u8]) -> Option<String> {
    let mut buf = data;
    let packets = rtcp::packet::unmarshal(&mut buf).ok()?;
    let kinds: Vec<String> = packets
        .iter()
        .map(|packet| format!("{:?}", packet.header().packet_type))
        .collect();
    Some(kinds.join("+"))
}

/// Pushes feedback buffers into the configured ingestion points
pub struct FeedbackInjector {
    points: Vec<String>,
    health: Arc<RelayHealth>,
}

impl FeedbackInjector {
    pub fn new(points: Vec<String>, health: Arc<RelayHealth>) -> Self {
        Self { points, health }
    }

    pub fn points(&self) -> &[String] {
        &self.points
    }

    /// Push `data` to every ingestion point of `graph`
    ///
    /// With no graph (pipeline stopped) every point is reported absent.
    pub fn push(&self, graph: Option<&dyn EngineGraph>, data: Bytes) -> FeedbackReport {
        if log_enabled!(Level::Debug) {
            match describe(&data) {
                Some(kinds) => debug!("Feedback: {} bytes ({})", data.len(), kinds),
                None => debug!("Feedback: {} bytes (unparsed)", data.len()),
            }
        }

        let mut report = FeedbackReport::default();
        for point in &self.points {
            let Some(stage) = graph.and_then(|graph| graph.stage(point)) else {
                report.absent.push(point.clone());
                continue;
            };
            let Some(source) = stage.as_source() else {
                warn!("Feedback: stage `{}` cannot accept buffers", point);
                report.absent.push(point.clone());
                continue;
            };

            match source.push_buffer(data.clone()) {
                Ok(_) => {
                    self.health.record_feedback_push();
                    report.delivered.push(point.clone());
                }
                Err(e) => {
                    warn!("Feedback: push into `{}` failed: {}", point, e);
                    self.health.record_feedback_failure();
                    report.failed.push((point.clone(), e));
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MediaEngine;
    use crate::engine::sim::SimEngine;
    use crate::pipeline::state::PipelineState;

    // Receiver report with no blocks, SSRC 1
    const RECEIVER_REPORT: [u8; 8] = [0x80, 0xc9, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01];

    fn injector(health: Arc<RelayHealth>) -> FeedbackInjector {
        FeedbackInjector::new(vec!["rtcpsrc0".into(), "rtcpsrc1".into()], health)
    }

    fn playing(description: &str) -> (SimEngine, Arc<dyn EngineGraph>) {
        let engine = SimEngine::new();
        let graph = engine.launch(description).unwrap();
        graph.set_state(PipelineState::Playing).unwrap();
        (engine, graph)
    }

    #[test]
    fn test_describe_rtcp() {
        assert!(describe(&RECEIVER_REPORT).is_some());
        assert!(describe(&[0xde, 0xad]).is_none());
    }

    #[test]
    fn test_fans_out_to_every_point() {
        let (engine, graph) = playing("appsrc name=rtcpsrc0 ! fakesink appsrc name=rtcpsrc1 ! fakesink");
        let health = Arc::new(RelayHealth::new());

        let report = injector(health.clone()).push(Some(graph.as_ref()), Bytes::from_static(&RECEIVER_REPORT));

        assert!(report.is_complete());
        assert_eq!(report.delivered, vec!["rtcpsrc0", "rtcpsrc1"]);
        let sim = engine.latest().unwrap();
        assert_eq!(sim.pushed("rtcpsrc0"), vec![Bytes::from_static(&RECEIVER_REPORT)]);
        assert_eq!(sim.pushed("rtcpsrc1"), vec![Bytes::from_static(&RECEIVER_REPORT)]);
        assert_eq!(health.feedback_pushes(), 2);
    }

    #[test]
    fn test_failing_point_does_not_block_the_rest() {
        let (engine, graph) = playing("appsrc name=rtcpsrc0 ! fakesink appsrc name=rtcpsrc1 ! fakesink");
        let sim = engine.latest().unwrap();
        sim.set_source_failing("rtcpsrc0", true).unwrap();
        let health = Arc::new(RelayHealth::new());

        let report = injector(health.clone()).push(Some(graph.as_ref()), Bytes::from_static(&[1, 2, 3]));

        assert_eq!(report.delivered, vec!["rtcpsrc1"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "rtcpsrc0");
        assert_eq!(sim.pushed("rtcpsrc1"), vec![Bytes::from_static(&[1, 2, 3])]);
        assert_eq!(health.feedback_failures(), 1);
        assert_eq!(health.feedback_pushes(), 1);
    }

    #[test]
    fn test_missing_points_are_reported_absent() {
        let (_engine, graph) = playing("appsrc name=rtcpsrc0 ! fakesink fakesrc name=rtcpsrc1 ! fakesink");
        let report = injector(Arc::new(RelayHealth::new()))
            .push(Some(graph.as_ref()), Bytes::from_static(&RECEIVER_REPORT));

        assert_eq!(report.delivered, vec!["rtcpsrc0"]);
        assert_eq!(report.absent, vec!["rtcpsrc1"]);
        assert!(report.delivered_anywhere());
        assert_eq!(report.to_string(), "1 delivered, 0 failed, 1 absent");
    }

    #[test]
    fn test_no_graph_means_all_absent() {
        let report = injector(Arc::new(RelayHealth::new())).push(None, Bytes::from_static(&[0]));
        assert_eq!(report.absent.len(), 2);
        assert!(!report.delivered_anywhere());
    }
}
