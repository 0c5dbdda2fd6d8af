//! Live encoder parameter changes
//!
//! Parameters are a closed set. Each one is resolved to a concrete engine
//! property per stage: the configured encoder binding when the stage is one of
//! the configured encoders, otherwise whatever the stage's factory uses.

use log::debug;

use crate::config::{BitrateProperty, BridgeConfig, EncoderBinding};
use crate::engine::{EngineStage, PropertyValue};
use crate::error::Result;
use crate::pipeline::lifecycle::Pipeline;
use crate::profile::bitrate_property_for;

const DEFAULT_LOSS_PROPERTY: &str = "packet-loss-percentage";

/// Parameters that can be changed without restarting the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageParameter {
    /// Target bitrate in bits per second
    Bitrate(u32),
    /// Expected packet loss, 0-100
    PacketLossPercentage(u32),
}

/// What a parameter change did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The stage's property was changed
    Mutated,
    /// No such stage (or the pipeline is stopped); nothing was changed
    StageAbsent,
}

impl Applied {
    pub fn is_mutated(&self) -> bool {
        matches!(self, Applied::Mutated)
    }
}

fn binding<'a>(config: &'a BridgeConfig, stage: &str) -> Option<&'a EncoderBinding> {
    [&config.video_encoder, &config.audio_encoder]
        .into_iter()
        .find(|binding| binding.stage == stage)
}

fn resolve(config: &BridgeConfig, stage: &dyn EngineStage, parameter: StageParameter) -> (String, PropertyValue) {
    let binding = binding(config, &stage.name());
    match parameter {
        StageParameter::Bitrate(bits_per_second) => {
            let property = binding
                .map(|binding| binding.bitrate.clone())
                .or_else(|| bitrate_property_for(&stage.factory()))
                .unwrap_or_else(BitrateProperty::default);
            let value = PropertyValue::UInt(u64::from(property.scale(bits_per_second)));
            (property.name, value)
        }
        StageParameter::PacketLossPercentage(percent) => {
            let property = binding
                .map(|binding| binding.loss_property.clone())
                .unwrap_or_else(|| DEFAULT_LOSS_PROPERTY.to_string());
            (property, PropertyValue::UInt(u64::from(percent.min(100))))
        }
    }
}

/// Applies [`StageParameter`]s to named stages of a running pipeline
///
/// Holds no stage references: every call looks the stage up again, so calls
/// are safe from any thread, during relay notifications and concurrently with
/// stop.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParameterController;

impl ParameterController {
    pub fn new() -> Self {
        Self
    }

    /// Apply `parameter` to the stage named `stage`
    pub fn apply(&self, pipeline: &Pipeline, stage: &str, parameter: StageParameter) -> Result<Applied> {
        let outcome = pipeline.with_stage(stage, |handle| {
            let (property, value) = resolve(pipeline.config(), handle, parameter);
            debug!(
                "ParameterController: pipeline {} {}.{} = {}",
                pipeline.id(),
                stage,
                property,
                value
            );
            handle.set_property(&property, value)
        });

        match outcome {
            Some(result) => {
                result?;
                Ok(Applied::Mutated)
            }
            None => {
                debug!(
                    "ParameterController: pipeline {} has no stage `{}`, {:?} skipped",
                    pipeline.id(),
                    stage,
                    parameter
                );
                Ok(Applied::StageAbsent)
            }
        }
    }

    pub fn set_bitrate(&self, pipeline: &Pipeline, stage: &str, bits_per_second: u32) -> Result<Applied> {
        self.apply(pipeline, stage, StageParameter::Bitrate(bits_per_second))
    }

    pub fn set_loss_percentage(&self, pipeline: &Pipeline, stage: &str, percent: u32) -> Result<Applied> {
        self.apply(pipeline, stage, StageParameter::PacketLossPercentage(percent))
    }
}
