//! Encoder profiles
//!
//! Ready-made encode fragments per codec and platform, together with the way
//! each encoder expects its bitrate to be set.

use serde::{Deserialize, Serialize};

use crate::config::{BitrateProperty, BridgeConfig, EncoderBinding, SinkBinding};
use crate::error::{BridgeError, Result};
use crate::pipeline::types::MediaKind;
use crate::rtp::payload::Codec;

/// Stage name given to the video encoder of a profile
pub const VIDEO_ENCODER: &str = "videoencode";
/// Stage name given to the audio encoder of a profile
pub const AUDIO_ENCODER: &str = "audioencode";

/// Hardware the encode graph runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Software encoders (`vp8enc`, `x264enc`, `x265enc`)
    Desktop,
    /// NVIDIA Jetson: `nvvidconv` + `nvv4l2*enc`
    Jetson,
}

impl Platform {
    /// Platform matching the build target
    pub fn current() -> Self {
        if cfg!(any(target_arch = "arm", target_arch = "aarch64")) {
            Platform::Jetson
        } else {
            Platform::Desktop
        }
    }
}

/// Bitrate property of a known encoder factory
pub fn bitrate_property_for(factory: &str) -> Option<BitrateProperty> {
    match factory {
        "vp8enc" | "vp9enc" => Some(BitrateProperty::new("target-bitrate", 1)),
        // kbit/s
        "x264enc" | "x265enc" => Some(BitrateProperty::new("bitrate", 1000)),
        "opusenc" => Some(BitrateProperty::new("bitrate", 1)),
        f if f.starts_with("nvv4l2") => Some(BitrateProperty::new("bitrate", 1)),
        _ => None,
    }
}

/// Encode fragment for one codec on one platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderProfile {
    codec: Codec,
    platform: Platform,
    encoder: String,
    bitrate: BitrateProperty,
}

impl EncoderProfile {
    pub fn new(codec: Codec, platform: Platform) -> Result<Self> {
        let (encoder, factory) = match (platform, codec) {
            (Platform::Desktop, Codec::Vp8) => (
                format!(
                    "videoconvert ! vp8enc error-resilient=partitions keyframe-max-dist=10 auto-alt-ref=true \
                     cpu-used=5 deadline=1 target-bitrate=6000000 name={}",
                    VIDEO_ENCODER
                ),
                "vp8enc",
            ),
            (Platform::Desktop, Codec::H264) => (
                format!("videoconvert ! x264enc tune=zerolatency bitrate=1000 name={}", VIDEO_ENCODER),
                "x264enc",
            ),
            (Platform::Desktop, Codec::H265) => (
                format!(
                    "videoconvert ! x265enc speed-preset=ultrafast tune=zerolatency bitrate=3000 name={}",
                    VIDEO_ENCODER
                ),
                "x265enc",
            ),
            (Platform::Jetson, Codec::Vp8) => (
                format!(
                    "nvvidconv interpolation-method=5 ! nvv4l2vp8enc bitrate=1000000 preset-level=1 name={}",
                    VIDEO_ENCODER
                ),
                "nvv4l2vp8enc",
            ),
            (Platform::Jetson, Codec::H264) => (
                format!(
                    "nvvidconv interpolation-method=5 ! video/x-raw(memory:NVMM),format=I420 ! \
                     nvv4l2h264enc bitrate=1000000 preset-level=4 EnableTwopassCBR=true insert-sps-pps=true name={} ! \
                     video/x-h264,stream-format=byte-stream",
                    VIDEO_ENCODER
                ),
                "nvv4l2h264enc",
            ),
            (Platform::Jetson, Codec::H265) => (
                format!(
                    "nvvidconv interpolation-method=5 ! video/x-raw(memory:NVMM),format=I420 ! \
                     nvv4l2h265enc bitrate=1000000 preset-level=4 EnableTwopassCBR=true insert-sps-pps=true name={} ! \
                     video/x-h265,stream-format=byte-stream",
                    VIDEO_ENCODER
                ),
                "nvv4l2h265enc",
            ),
            (_, Codec::Opus) => (
                format!("audioconvert ! opusenc inband-fec=true name={}", AUDIO_ENCODER),
                "opusenc",
            ),
            (platform, codec) => {
                return Err(BridgeError::Configuration(format!(
                    "no {:?} encoder profile for {}",
                    platform, codec
                )));
            }
        };

        let bitrate = bitrate_property_for(factory).unwrap_or_default();
        Ok(Self {
            codec,
            platform,
            encoder,
            bitrate,
        })
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn bitrate(&self) -> &BitrateProperty {
        &self.bitrate
    }

    /// Name of the encoder stage inside the fragment
    pub fn stage(&self) -> &'static str {
        match self.codec.media_kind() {
            MediaKind::Video => VIDEO_ENCODER,
            MediaKind::Audio => AUDIO_ENCODER,
        }
    }

    /// Name of the application sink closing the description
    pub fn sink_name(&self) -> &'static str {
        match self.codec.media_kind() {
            MediaKind::Video => "videoappsink",
            MediaKind::Audio => "audioappsink",
        }
    }

    /// Conversion and encoder stages, without source or sink
    pub fn encode_fragment(&self) -> &str {
        &self.encoder
    }

    /// Complete description: `source`, the encoder, and an application sink
    pub fn description(&self, source: &str) -> String {
        let sink_options = match self.platform {
            Platform::Desktop => "sync=true",
            Platform::Jetson => "async=false sync=false",
        };
        format!(
            "{} ! {} ! appsink name={} {}",
            source,
            self.encoder,
            self.sink_name(),
            sink_options
        )
    }

    pub fn encoder_binding(&self) -> EncoderBinding {
        EncoderBinding::new(self.stage(), self.bitrate.clone())
    }

    /// Bridge settings relaying this profile's sink
    pub fn bridge_config(&self) -> BridgeConfig {
        let mut config = BridgeConfig {
            sinks: vec![SinkBinding::mandatory(self.sink_name()).with_kind(self.codec.media_kind())],
            ..BridgeConfig::default()
        };
        match self.codec.media_kind() {
            MediaKind::Video => config.video_encoder = self.encoder_binding(),
            MediaKind::Audio => config.audio_encoder = self.encoder_binding(),
        }
        config
    }
}

/// RTP send graph around `rtpbin`
///
/// VP8 from `source` on session 0; `rtpsink` and `rtcpsink` carry the outgoing
/// RTP and RTCP, `rtcpsrc0` and `rtcpsrc1` take feedback from the peer. Stage
/// names match [`BridgeConfig::rtp_sender`].
pub fn rtp_sender_description(source: &str, cname: &str) -> String {
    format!(
        "rtpbin name=rtpbin rtp-profile=avpf sdes=application/x-rtp-source-sdes,cname=(string){cname} \
         {source} ! videoconvert ! vp8enc name=videoencoder error-resilient=partitions keyframe-max-dist=10 \
         cpu-used=5 deadline=1 target-bitrate=6000000 ! rtpvp8pay pt=96 ! rtpbin.send_rtp_sink_0 \
         rtpbin.send_rtp_src_0 ! appsink name=rtpsink \
         rtpbin.send_rtcp_src_0 ! appsink name=rtcpsink sync=false async=false \
         appsrc name=rtcpsrc0 ! rtpbin.recv_rtcp_sink_0 \
         appsrc name=rtcpsrc1 ! rtpbin.recv_rtcp_sink_1",
    )
}
