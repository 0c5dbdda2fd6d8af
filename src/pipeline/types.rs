//! Core types shared by the relay and the feedback path

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identifies a pipeline inside the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PipelineId(pub u64);

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of media carried by a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Video frames or video RTP
    Video,
    /// Audio samples or audio RTP
    Audio,
}

impl MediaKind {
    /// Name used by the engine in caps (`media=video`)
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "Video"),
            MediaKind::Audio => write!(f, "Audio"),
        }
    }
}

/// One completed unit pulled from a sink stage
///
/// `data` is always an application-owned copy: the engine recycles the memory
/// backing the original buffer as soon as the notification returns.
#[derive(Clone, PartialEq, Eq)]
pub struct DataUnit {
    /// Copied payload
    pub data: Bytes,

    /// Buffer duration, when the engine knows it
    pub duration: Option<Duration>,

    /// Presentation timestamp, when the engine knows it
    pub pts: Option<Duration>,
}

impl DataUnit {
    /// Build a unit by copying `bytes` out of engine memory
    pub fn copy_from(bytes: &[u8], duration: Option<Duration>, pts: Option<Duration>) -> Self {
        Self {
            data: Bytes::copy_from_slice(bytes),
            duration,
            pts,
        }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::fmt::Debug for DataUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataUnit")
            .field("size", &self.len())
            .field("duration", &self.duration)
            .field("pts", &self.pts)
            .finish()
    }
}

/// Point-in-time congestion and jitter snapshot from the session manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSample {
    /// Send bitrate in bits per second
    pub bitrate_sent: u32,
    /// Receive bitrate in bits per second
    pub bitrate_recv: u32,
    pub packets_sent: u32,
    pub packets_recv: u32,
    /// Average inter-arrival delta-of-delta, in nanoseconds
    pub avg_delta_of_delta: i64,
}

impl StatsSample {
    /// Fraction of sent packets that were reported received, if any were sent
    pub fn delivery_ratio(&self) -> Option<f64> {
        if self.packets_sent == 0 {
            return None;
        }
        Some(self.packets_recv as f64 / self.packets_sent as f64)
    }
}

impl std::fmt::Display for StatsSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sent {} bps recv {} bps, pkt sent {} pkt recv {}, delta of delta {}",
            self.bitrate_sent,
            self.bitrate_recv,
            self.packets_sent,
            self.packets_recv,
            self.avg_delta_of_delta
        )
    }
}
