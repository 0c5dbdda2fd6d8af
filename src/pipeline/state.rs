//! Pipeline state management

/// Pipeline state machine
///
/// Mirrors the engine's element states. Start walks `Null → Ready → Paused →
/// Playing` one step at a time; stop drops straight back to `Null` from any
/// active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PipelineState {
    /// No resources allocated, streaming threads stopped
    Null,

    /// Resources allocated, nothing flowing
    Ready,

    /// Prerolled, clock stopped
    Paused,

    /// Data is flowing and notifications are being emitted
    Playing,
}

impl PipelineState {
    /// Intermediate states (excluding `self`) needed to reach `target` going up
    ///
    /// Returns `None` when `target` is below `self`.
    pub fn upward_path(&self, target: PipelineState) -> Option<Vec<PipelineState>> {
        if target < *self {
            return None;
        }

        let path = [
            PipelineState::Ready,
            PipelineState::Paused,
            PipelineState::Playing,
        ]
        .into_iter()
        .filter(|step| *step > *self && *step <= target)
        .collect();

        Some(path)
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            PipelineState::Null => "Null",
            PipelineState::Ready => "Ready",
            PipelineState::Paused => "Paused",
            PipelineState::Playing => "Playing",
        }
    }

    /// Check if the pipeline is playing
    pub fn is_playing(&self) -> bool {
        matches!(self, PipelineState::Playing)
    }

    /// Check if the pipeline is back to `Null`
    pub fn is_null(&self) -> bool {
        matches!(self, PipelineState::Null)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
