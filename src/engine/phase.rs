//! Engine phase machine
//!
//! The engine's authoritative record of where it is in the
//! Detect/Plan/Apply lifecycle. Requests that do not fit the current phase
//! are rejected before any work starts.
//!
//! ```text
//! Idle
//!   ↓ detect
//! Detecting → Detected ←──────────┐
//!   ↓ plan                        │ detect again
//! Planning  → Planned ────────────┘
//!   ↓ apply     ↺ plan again
//! Applying  → Applied | Failed   (terminal)
//! ```
//!
//! A phase that is cancelled or fails before changing anything returns to the
//! phase it started from; only Apply can end in `Failed`.

use std::fmt;
use strum::{Display, EnumIter};
use thiserror::Error;

/// The three requests a UX can make of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum Operation {
    Detect,
    Plan,
    Apply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, EnumIter)]
pub enum EnginePhase {
    #[default]
    Idle,
    Detecting,
    Detected,
    Planning,
    Planned,
    Applying,
    /// Terminal: apply finished (or was suspended)
    Applied,
    /// Terminal: apply failed and rolled back
    Failed,
}

impl EnginePhase {
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Applied | Self::Failed)
    }

    /// True while an operation is running.
    #[inline]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Detecting | Self::Planning | Self::Applying)
    }

    /// Whether `op` may start from this phase.
    pub const fn can_start(self, op: Operation) -> bool {
        match op {
            Operation::Detect => matches!(self, Self::Idle | Self::Detected | Self::Planned),
            Operation::Plan => matches!(self, Self::Detected | Self::Planned),
            Operation::Apply => matches!(self, Self::Planned),
        }
    }

    pub const fn running(op: Operation) -> Self {
        match op {
            Operation::Detect => Self::Detecting,
            Operation::Plan => Self::Planning,
            Operation::Apply => Self::Applying,
        }
    }

    pub const fn finished(op: Operation) -> Self {
        match op {
            Operation::Detect => Self::Detected,
            Operation::Plan => Self::Planned,
            Operation::Apply => Self::Applied,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Detecting => "Detecting",
            Self::Detected => "Detected",
            Self::Planning => "Planning",
            Self::Planned => "Planned",
            Self::Applying => "Applying",
            Self::Applied => "Applied",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Errors from requesting an operation in the wrong phase
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PhaseTransitionError {
    #[error("Cannot {op} while {phase} (another operation is running)")]
    Busy { op: Operation, phase: EnginePhase },

    #[error("Cannot {op} from phase {phase}")]
    NotAllowed { op: Operation, phase: EnginePhase },

    #[error("Cannot {op}: the engine is {phase} (terminal)")]
    FromTerminalState { op: Operation, phase: EnginePhase },

    #[error("No {op} is running (phase {phase})")]
    NotRunning { op: Operation, phase: EnginePhase },
}

impl From<PhaseTransitionError> for crate::error::BurnError {
    fn from(err: PhaseTransitionError) -> Self {
        match err {
            PhaseTransitionError::Busy { .. } => crate::error::BurnError::State(err.to_string()),
            _ => crate::error::BurnError::Phase(err.to_string()),
        }
    }
}

/// Phase plus the phase an operation started from.
#[derive(Debug, Clone, Default)]
pub struct PhaseMachine {
    current: EnginePhase,
    started_from: Option<EnginePhase>,
    history: Vec<EnginePhase>,
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn current(&self) -> EnginePhase {
        self.current
    }

    pub fn history(&self) -> &[EnginePhase] {
        &self.history
    }

    /// Check that `op` could start now, without starting it.
    pub fn check(&self, op: Operation) -> Result<(), PhaseTransitionError> {
        let phase = self.current;
        if phase.is_running() {
            Err(PhaseTransitionError::Busy { op, phase })
        } else if phase.is_terminal() {
            Err(PhaseTransitionError::FromTerminalState { op, phase })
        } else if !phase.can_start(op) {
            Err(PhaseTransitionError::NotAllowed { op, phase })
        } else {
            Ok(())
        }
    }

    pub fn begin(&mut self, op: Operation) -> Result<(), PhaseTransitionError> {
        self.check(op)?;
        self.started_from = Some(self.current);
        self.enter(EnginePhase::running(op));
        Ok(())
    }

    /// Finish `op` successfully.
    pub fn complete(&mut self, op: Operation) -> Result<(), PhaseTransitionError> {
        self.require_running(op)?;
        self.started_from = None;
        self.enter(EnginePhase::finished(op));
        Ok(())
    }

    /// Abandon `op`: back to where it started, or `Failed` for Apply.
    pub fn abandon(&mut self, op: Operation, failed: bool) -> Result<(), PhaseTransitionError> {
        self.require_running(op)?;
        let next = match (op, failed) {
            (Operation::Apply, true) => EnginePhase::Failed,
            _ => self.started_from.unwrap_or(EnginePhase::Idle),
        };
        self.started_from = None;
        self.enter(next);
        Ok(())
    }

    fn require_running(&self, op: Operation) -> Result<(), PhaseTransitionError> {
        if self.current == EnginePhase::running(op) {
            Ok(())
        } else {
            Err(PhaseTransitionError::NotRunning {
                op,
                phase: self.current,
            })
        }
    }

    fn enter(&mut self, phase: EnginePhase) {
        tracing::debug!("Engine phase {} -> {}", self.current, phase);
        self.history.push(phase);
        self.current = phase;
    }
}
