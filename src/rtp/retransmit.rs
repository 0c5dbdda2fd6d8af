//! Auxiliary retransmission stages
//!
//! When the session manager asks for an auxiliary sender on a session, the
//! factory hands back a retransmit stage description: the payload remap table
//! and the two ghost pad names the engine splices into the session. The engine
//! backend realises it (for GStreamer, a bin around `rtprtxsend`).

use log::info;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Retransmit sub-stage bound to one session
#[derive(Debug, PartialEq, Eq)]
pub struct RetransmitStage {
    session_id: u32,
    payload_map: BTreeMap<u8, u8>,
    src_pad: String,
    sink_pad: String,
}

impl RetransmitStage {
    fn new(session_id: u32, payload_map: BTreeMap<u8, u8>) -> Self {
        Self {
            session_id,
            payload_map,
            src_pad: format!("src_{}", session_id),
            sink_pad: format!("sink_{}", session_id),
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Original payload type → retransmission payload type
    pub fn payload_map(&self) -> &BTreeMap<u8, u8> {
        &self.payload_map
    }

    /// Ghost pad the session manager reads from
    pub fn src_pad(&self) -> &str {
        &self.src_pad
    }

    /// Ghost pad the session manager writes into
    pub fn sink_pad(&self) -> &str {
        &self.sink_pad
    }
}

/// Builds one retransmit stage per session, lazily
///
/// Owned by a single pipeline: the stages it hands out live as long as that
/// pipeline does.
pub struct RetransmissionStageFactory {
    payload_map: BTreeMap<u8, u8>,
    sessions: Mutex<HashMap<u32, Arc<RetransmitStage>>>,
}

impl RetransmissionStageFactory {
    pub fn new(payload_map: BTreeMap<u8, u8>) -> Self {
        Self {
            payload_map,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Answer a `request-aux-sender` for `session_id`
    ///
    /// Idempotent: repeated requests for the same session return the same stage.
    pub fn on_auxiliary_sender_requested(&self, session_id: u32) -> Arc<RetransmitStage> {
        let mut sessions = self.sessions.lock();
        sessions
            .entry(session_id)
            .or_insert_with(|| {
                info!(
                    "RetransmissionStageFactory: building retransmit stage for session {} ({:?})",
                    session_id, self.payload_map
                );
                Arc::new(RetransmitStage::new(session_id, self.payload_map.clone()))
            })
            .clone()
    }

    /// Stage already built for `session_id`
    pub fn stage(&self, session_id: u32) -> Option<Arc<RetransmitStage>> {
        self.sessions.lock().get(&session_id).cloned()
    }

    /// Number of sessions with a retransmit stage
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

impl Default for RetransmissionStageFactory {
    fn default() -> Self {
        Self::new(default_payload_map())
    }
}

/// VP8 (96) → 97 and Opus (111) → 112
pub fn default_payload_map() -> BTreeMap<u8, u8> {
    BTreeMap::from([(96, 97), (111, 112)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_session_reuses_stage() {
        let factory = RetransmissionStageFactory::default();

        let first = factory.on_auxiliary_sender_requested(0);
        let second = factory.on_auxiliary_sender_requested(0);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.session_count(), 1);
    }

    #[test]
    fn test_pad_names_follow_session_id() {
        let factory = RetransmissionStageFactory::default();
        let stage = factory.on_auxiliary_sender_requested(3);

        assert_eq!(stage.session_id(), 3);
        assert_eq!(stage.src_pad(), "src_3");
        assert_eq!(stage.sink_pad(), "sink_3");
    }

    #[test]
    fn test_sessions_get_distinct_stages() {
        let factory = RetransmissionStageFactory::default();
        let a = factory.on_auxiliary_sender_requested(0);
        let b = factory.on_auxiliary_sender_requested(1);

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(factory.session_count(), 2);
        assert!(factory.stage(1).is_some());
        assert!(factory.stage(2).is_none());
    }

    #[test]
    fn test_default_remap_table() {
        let stage = RetransmissionStageFactory::default().on_auxiliary_sender_requested(0);

        assert_eq!(stage.payload_map().get(&96), Some(&97));
        assert_eq!(stage.payload_map().get(&111), Some(&112));
        assert_eq!(stage.payload_map().get(&98), None);
        assert_eq!(stage.payload_map().len(), 2);
    }

    #[test]
    fn test_concurrent_requests_build_once() {
        let factory = Arc::new(RetransmissionStageFactory::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let factory = factory.clone();
                std::thread::spawn(move || factory.on_auxiliary_sender_requested(5))
            })
            .collect();

        let stages: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(stages.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(factory.session_count(), 1);
    }
}
