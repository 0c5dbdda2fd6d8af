use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::Result;
use crate::pipeline::types::MediaKind;
use crate::rtp::retransmit::default_payload_map;

/// A sink stage the relay binds to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkBinding {
    /// Stage name in the description (`name=rtpsink`)
    pub name: String,

    /// Start fails when a mandatory sink is missing
    #[serde(default)]
    pub mandatory: bool,

    /// Media kind reported to the consumer with each unit
    #[serde(default)]
    pub kind: Option<MediaKind>,
}

impl SinkBinding {
    pub fn mandatory(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mandatory: true,
            kind: None,
        }
    }

    pub fn optional(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mandatory: false,
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: MediaKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

/// How to change the bitrate of one encoder stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitrateProperty {
    /// Property name (`target-bitrate` for vp8enc, `bitrate` for x264enc)
    pub name: String,

    /// The value written is `bits_per_second / divisor` (x264enc takes kbit/s)
    pub divisor: u32,
}

impl BitrateProperty {
    pub fn new(name: &str, divisor: u32) -> Self {
        Self {
            name: name.to_string(),
            divisor: divisor.max(1),
        }
    }

    /// Engine value for a bitrate in bits per second
    pub fn scale(&self, bits_per_second: u32) -> u32 {
        bits_per_second / self.divisor.max(1)
    }
}

impl Default for BitrateProperty {
    fn default() -> Self {
        Self::new("target-bitrate", 1)
    }
}

/// Encoder stage whose parameters can be changed at runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderBinding {
    /// Stage name in the description
    pub stage: String,

    #[serde(default)]
    pub bitrate: BitrateProperty,

    /// Property carrying the expected packet-loss percentage
    #[serde(default = "default_loss_property")]
    pub loss_property: String,
}

fn default_loss_property() -> String {
    "packet-loss-percentage".to_string()
}

impl EncoderBinding {
    pub fn new(stage: &str, bitrate: BitrateProperty) -> Self {
        Self {
            stage: stage.to_string(),
            bitrate,
            loss_property: default_loss_property(),
        }
    }
}

/// Bridge settings: which named stages the bridge wires up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Sinks the relay binds to, in wiring order
    pub sinks: Vec<SinkBinding>,

    /// RTP session manager stage (`rtpbin`); optional
    pub session_manager: String,

    /// Sources that receive external transport feedback
    pub feedback_sources: Vec<String>,

    pub video_encoder: EncoderBinding,

    pub audio_encoder: EncoderBinding,

    /// Original payload type → retransmission payload type
    pub retransmit_payload_map: BTreeMap<u8, u8>,
}

impl BridgeConfig {
    /// RTP sender graph: `rtpsink` carries media, `rtcpsink` carries control
    pub fn rtp_sender() -> Self {
        Self {
            sinks: vec![
                SinkBinding::mandatory("rtpsink"),
                SinkBinding::optional("rtcpsink"),
            ],
            session_manager: "rtpbin".to_string(),
            feedback_sources: vec!["rtcpsrc0".to_string(), "rtcpsrc1".to_string()],
            video_encoder: EncoderBinding::new("videoencoder", BitrateProperty::default()),
            audio_encoder: EncoderBinding::new("audioencode", BitrateProperty::new("bitrate", 1)),
            retransmit_payload_map: default_payload_map(),
        }
    }

    /// Encode-only graph: separate audio and video sinks, packetized downstream
    pub fn media_sinks() -> Self {
        Self {
            sinks: vec![
                SinkBinding::optional("video_sink").with_kind(MediaKind::Video),
                SinkBinding::optional("audio_sink").with_kind(MediaKind::Audio),
            ],
            video_encoder: EncoderBinding::new("video_encode", BitrateProperty::default()),
            ..Self::rtp_sender()
        }
    }

    /// Pick a preset by name (`rtp-sender`, `media-sinks`)
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "rtp-sender" => Some(Self::rtp_sender()),
            "media-sinks" => Some(Self::media_sinks()),
            _ => None,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Sinks whose absence aborts start
    pub fn mandatory_sinks(&self) -> impl Iterator<Item = &SinkBinding> {
        self.sinks.iter().filter(|sink| sink.mandatory)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::rtp_sender()
    }
}
