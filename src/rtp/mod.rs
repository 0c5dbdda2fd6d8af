//! RTP session plumbing: retransmission, payload types, statistics and feedback

pub mod feedback;
pub mod payload;
pub mod retransmit;
pub mod stats;
