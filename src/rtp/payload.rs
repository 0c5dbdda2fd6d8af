//! Dynamic payload-type resolution
//!
//! The session manager asks what an incoming dynamic payload type means when a
//! stream is set up. The answer comes from a closed table: extending the set of
//! codecs means extending [`DynamicPayloadResolver::resolve`].

use log::debug;
use serde::{Deserialize, Serialize};

use crate::pipeline::types::MediaKind;

/// Transport-wide congestion control header extension
pub const TWCC_EXTENSION_URI: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";

/// Codecs the bridge can negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    Vp8,
    Vp9,
    H264,
    H265,
    Opus,
}

impl Codec {
    /// RTP encoding name as it appears in caps
    pub fn encoding_name(&self) -> &'static str {
        match self {
            Codec::Vp8 => "VP8",
            Codec::Vp9 => "VP9",
            Codec::H264 => "H264",
            Codec::H265 => "H265",
            Codec::Opus => "OPUS",
        }
    }

    pub fn media_kind(&self) -> MediaKind {
        match self {
            Codec::Opus => MediaKind::Audio,
            _ => MediaKind::Video,
        }
    }

    /// Case-insensitive lookup by encoding name
    pub fn from_name(name: &str) -> Option<Self> {
        [Codec::Vp8, Codec::Vp9, Codec::H264, Codec::H265, Codec::Opus]
            .into_iter()
            .find(|codec| codec.encoding_name().eq_ignore_ascii_case(name))
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encoding_name())
    }
}

/// RTP header extension required by a payload type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderExtension {
    /// Extension id as negotiated (`extmap-<id>`)
    pub id: u8,
    pub uri: &'static str,
}

/// Decoded meaning of a negotiated payload type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityDescriptor {
    pub payload_type: u8,
    pub media: MediaKind,
    pub clock_rate: u32,
    pub codec: Codec,
    pub extension: Option<HeaderExtension>,
}

impl CapabilityDescriptor {
    pub fn encoding_name(&self) -> &'static str {
        self.codec.encoding_name()
    }
}

/// Maps payload-type numbers to capabilities for the session manager
#[derive(Debug, Clone, Copy, Default)]
pub struct DynamicPayloadResolver;

impl DynamicPayloadResolver {
    pub fn new() -> Self {
        Self
    }

    /// Answer a `request-pt-map` for `session_id`
    ///
    /// `None` tells the engine to leave the stream unhandled.
    pub fn on_payload_type_requested(
        &self,
        session_id: u32,
        payload_type: u32,
    ) -> Option<CapabilityDescriptor> {
        let resolved = Self::resolve(payload_type);
        match &resolved {
            Some(caps) => debug!(
                "PayloadResolver: session {} pt {} -> {} {} @{}",
                session_id, payload_type, caps.media, caps.codec, caps.clock_rate
            ),
            None => debug!(
                "PayloadResolver: session {} pt {} unknown, leaving unhandled",
                session_id, payload_type
            ),
        }
        resolved
    }

    /// The fixed payload table
    pub fn resolve(payload_type: u32) -> Option<CapabilityDescriptor> {
        match payload_type {
            96 => Some(CapabilityDescriptor {
                payload_type: 96,
                media: MediaKind::Video,
                clock_rate: 90_000,
                codec: Codec::Vp8,
                extension: Some(HeaderExtension {
                    id: 5,
                    uri: TWCC_EXTENSION_URI,
                }),
            }),
            98 => Some(CapabilityDescriptor {
                payload_type: 98,
                media: MediaKind::Video,
                clock_rate: 90_000,
                codec: Codec::Vp9,
                extension: None,
            }),
            111 => Some(CapabilityDescriptor {
                payload_type: 111,
                media: MediaKind::Audio,
                clock_rate: 48_000,
                codec: Codec::Opus,
                extension: None,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_from_name() {
        assert_eq!(Codec::from_name("vp8"), Some(Codec::Vp8));
        assert_eq!(Codec::from_name("OPUS"), Some(Codec::Opus));
        assert_eq!(Codec::from_name("h266"), None);
    }

    #[test]
    fn test_vp8_carries_twcc_extension() {
        let caps = DynamicPayloadResolver::new()
            .on_payload_type_requested(0, 96)
            .unwrap();

        assert_eq!(caps.media, MediaKind::Video);
        assert_eq!(caps.codec, Codec::Vp8);
        assert_eq!(caps.clock_rate, 90_000);
        assert_eq!(caps.encoding_name(), "VP8");
        let ext = caps.extension.unwrap();
        assert_eq!(ext.id, 5);
        assert_eq!(ext.uri, TWCC_EXTENSION_URI);
    }

    #[test]
    fn test_vp9_and_opus() {
        let vp9 = DynamicPayloadResolver::resolve(98).unwrap();
        assert_eq!((vp9.media, vp9.codec, vp9.clock_rate), (MediaKind::Video, Codec::Vp9, 90_000));
        assert!(vp9.extension.is_none());

        let opus = DynamicPayloadResolver::resolve(111).unwrap();
        assert_eq!((opus.media, opus.codec, opus.clock_rate), (MediaKind::Audio, Codec::Opus, 48_000));
        assert_eq!(opus.encoding_name(), "OPUS");
    }

    #[test]
    fn test_unknown_payload_types_are_unhandled() {
        let resolver = DynamicPayloadResolver::new();
        for pt in [0, 37, 97, 112, 127, 1000] {
            assert!(resolver.on_payload_type_requested(1, pt).is_none(), "pt {}", pt);
        }
    }

    #[test]
    fn test_resolution_ignores_session() {
        let resolver = DynamicPayloadResolver::new();
        assert_eq!(
            resolver.on_payload_type_requested(0, 111),
            resolver.on_payload_type_requested(7, 111)
        );
    }
}
