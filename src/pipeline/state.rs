//! Stage lifecycle state machine

/// Lifecycle of an encoder or filter stage.
///
/// Transitions are validated so every stage moves through the same shape:
/// parameter validation and compressor open in `Starting`, the frame loop in
/// `Running`, compressor flush in `Draining`, resources released by
/// `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Validating parameters and opening the compressor
    Starting,
    /// Frame loop active
    Running,
    /// Flushing buffered compressor output after cancellation
    Draining,
    /// Terminal; resources released
    Stopped,
}

impl StageState {
    pub fn can_transition_to(&self, target: StageState) -> bool {
        use StageState::*;

        match (self, target) {
            (Starting, Running) => true,
            // A failed open skips straight to Stopped
            (Starting, Stopped) => true,
            (Running, Draining) => true,
            (Draining, Stopped) => true,
            // Terminal
            (Stopped, _) => false,
            (a, b) if *a == b => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StageState::Stopped)
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StageState::Starting => "Starting",
            StageState::Running => "Running",
            StageState::Draining => "Draining",
            StageState::Stopped => "Stopped",
        };
        write!(f, "{}", name)
    }
}
