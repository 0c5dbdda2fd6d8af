//! Bitrate adaptation driven by transport feedback
//!
//! Two policies on top of the [`ParameterController`]:
//! - [`BitrateAdapter`] follows the delay gradient reported in the session
//!   manager's stats and nudges the video bitrate up or down.
//! - [`EstimateApplier`] applies an externally computed bandwidth estimate to
//!   the video and audio encoders.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::parameters::{Applied, ParameterController};
use crate::error::Result;
use crate::pipeline::lifecycle::Pipeline;
use crate::pipeline::types::StatsSample;

pub const START_BITRATE: u32 = 6_000_000;
pub const MIN_BITRATE: u32 = 100_000;
pub const MAX_BITRATE: u32 = 10_000_000;

/// Bitrate kept aside for audio when applying a total estimate
pub const AUDIO_RESERVE: u32 = 64_000;

const SMOOTHING: i64 = 20;
const OVERUSE_MAGNITUDE: f64 = 40.0;
const UNDERUSE_MAGNITUDE: f64 = 20.0;
const DECREASE: f64 = 0.7;
const INCREASE: f64 = 1.08;

/// How the path is coping with the current rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Congestion {
    Overuse,
    Underuse,
    Hold,
}

/// Delay-gradient bitrate controller
#[derive(Debug, Clone)]
pub struct BitrateAdapter {
    state: i64,
    bitrate: u32,
}

impl BitrateAdapter {
    pub fn new() -> Self {
        Self::with_bitrate(START_BITRATE)
    }

    pub fn with_bitrate(bitrate: u32) -> Self {
        Self {
            state: 0,
            bitrate: bitrate.clamp(MIN_BITRATE, MAX_BITRATE),
        }
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    /// Smoothed delta-of-delta
    pub fn state(&self) -> i64 {
        self.state
    }

    fn classify(&self) -> Congestion {
        // ln(0) is -inf, which reads as underuse
        let magnitude = (self.state.unsigned_abs() as f64).ln();
        if magnitude > OVERUSE_MAGNITUDE {
            Congestion::Overuse
        } else if magnitude < UNDERUSE_MAGNITUDE {
            Congestion::Underuse
        } else {
            Congestion::Hold
        }
    }

    /// Fold one stats sample in; returns the new bitrate when it should change
    pub fn observe(&mut self, sample: &StatsSample) -> Option<u32> {
        self.state += sample.avg_delta_of_delta.saturating_sub(self.state) / SMOOTHING;

        // fractional bits are truncated
        let next = match self.classify() {
            Congestion::Overuse => (f64::from(self.bitrate) * DECREASE).max(f64::from(MIN_BITRATE)),
            Congestion::Underuse => (f64::from(self.bitrate) * INCREASE).min(f64::from(MAX_BITRATE)),
            Congestion::Hold => return None,
        } as u32;

        debug!(
            "BitrateAdapter: {} state {} -> {} bit/s",
            sample, self.state, next
        );
        self.bitrate = next;
        Some(next)
    }

    /// Observe `sample` and push any new bitrate to `stage`
    pub fn on_sample(&mut self, pipeline: &Pipeline, stage: &str, sample: &StatsSample) -> Result<Option<u32>> {
        let Some(bitrate) = self.observe(sample) else {
            return Ok(None);
        };
        let applied = ParameterController::new().set_bitrate(pipeline, stage, bitrate)?;
        Ok(applied.is_mutated().then_some(bitrate))
    }

    /// Apply stats samples from `samples` to the pipeline's video encoder
    /// until `cancel` fires or the sender goes away
    pub async fn run(
        mut self,
        pipeline: Arc<Pipeline>,
        mut samples: mpsc::Receiver<StatsSample>,
        cancel: CancellationToken,
    ) {
        let stage = pipeline.config().video_encoder.stage.clone();
        info!("BitrateAdapter: adapting `{}` from {} bit/s", stage, self.bitrate);

        loop {
            let sample = tokio::select! {
                _ = cancel.cancelled() => break,
                sample = samples.recv() => match sample {
                    Some(sample) => sample,
                    None => break,
                },
            };

            if let Err(e) = self.on_sample(&pipeline, &stage, &sample) {
                warn!("BitrateAdapter: failed to apply bitrate: {}", e);
            }
        }

        info!("BitrateAdapter: stopped at {} bit/s", self.bitrate);
    }
}

impl Default for BitrateAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Bandwidth estimate from an external congestion controller
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    /// Total target bitrate, bits per second
    pub bitrate: u32,
    /// Loss fraction, 0.0-1.0
    pub loss: f64,
}

impl Estimate {
    /// Video share of the estimate
    pub fn video_bitrate(&self) -> u32 {
        let bitrate = if self.bitrate > AUDIO_RESERVE {
            self.bitrate - AUDIO_RESERVE
        } else {
            self.bitrate
        };
        bitrate.max(MIN_BITRATE)
    }

    pub fn loss_percentage(&self) -> u32 {
        (self.loss.clamp(0.0, 1.0) * 100.0).round() as u32
    }
}

/// Applies [`Estimate`]s to the configured video and audio encoders
pub struct EstimateApplier {
    controller: ParameterController,
}

impl EstimateApplier {
    pub fn new() -> Self {
        Self {
            controller: ParameterController::new(),
        }
    }

    /// Returns what happened to the video and the audio encoder
    pub fn apply(&self, pipeline: &Pipeline, estimate: Estimate) -> Result<(Applied, Applied)> {
        let config = pipeline.config();
        let video = self.controller.set_bitrate(
            pipeline,
            &config.video_encoder.stage,
            estimate.video_bitrate(),
        )?;
        let audio = self.controller.set_loss_percentage(
            pipeline,
            &config.audio_encoder.stage,
            estimate.loss_percentage(),
        )?;
        debug!(
            "EstimateApplier: {} bit/s, {}% loss -> video {:?}, audio {:?}",
            estimate.bitrate,
            estimate.loss_percentage(),
            video,
            audio
        );
        Ok((video, audio))
    }
}

impl Default for EstimateApplier {
    fn default() -> Self {
        Self::new()
    }
}
