//! What a user experience may ask of the engine.
//!
//! Phase requests are checked against the current phase, then queued for the
//! engine thread; they never run on the caller's stack. Variable access and
//! formatting take the state lock for the duration of the call only.

use super::{Engine, Operation};
use crate::condition;
use crate::error::{BurnError, HResult, Result};
use crate::types::{BundleAction, LogLevel};
use crate::variables::Variant;
use crate::version::Version;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Sender;

/// Requests processed by the engine thread, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    Detect,
    Plan(BundleAction),
    Apply,
    Quit(HResult),
}

impl EngineCommand {
    pub fn operation(self) -> Option<Operation> {
        match self {
            Self::Detect => Some(Operation::Detect),
            Self::Plan(_) => Some(Operation::Plan),
            Self::Apply => Some(Operation::Apply),
            Self::Quit(_) => None,
        }
    }
}

/// The engine facade offered to user experiences.
pub trait BurnCore {
    fn detect(&self) -> Result<()>;
    fn plan(&self, action: BundleAction) -> Result<()>;
    fn apply(&self) -> Result<()>;

    /// Stop the running Apply at the next package boundary and save the
    /// session so a later run resumes it.
    fn suspend(&self);

    /// Restart the machine when the engine shuts down. A running Apply stops
    /// at the next package boundary and resumes after the restart.
    fn reboot(&self);

    fn get_numeric(&self, name: &str) -> Result<i64>;
    fn get_string(&self, name: &str) -> Result<String>;
    fn get_version(&self, name: &str) -> Result<Version>;
    fn set_numeric(&self, name: &str, value: i64) -> Result<()>;
    fn set_string(&self, name: &str, value: &str) -> Result<()>;
    fn set_version(&self, name: &str, value: Version) -> Result<()>;

    /// Expand `[Name]` references.
    fn format_string(&self, template: &str) -> Result<String>;

    fn evaluate_condition(&self, expression: &str) -> Result<bool>;

    /// Write a message to the engine log.
    fn log(&self, level: LogLevel, message: &str);

    /// End the message pump; `status` becomes the bundle's exit status.
    fn quit(&self, status: HResult) -> Result<()>;
}

/// A UX's handle on the engine.
#[derive(Clone)]
pub struct CoreHandle {
    engine: Arc<Engine>,
    tx: Sender<EngineCommand>,
}

impl CoreHandle {
    pub(crate) fn new(engine: Arc<Engine>, tx: Sender<EngineCommand>) -> Self {
        Self { engine, tx }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    fn post(&self, command: EngineCommand) -> Result<()> {
        if let Some(op) = command.operation() {
            self.engine.check(op)?;
        }
        tracing::debug!("Posting {:?}", command);
        self.tx
            .send(command)
            .map_err(|_| BurnError::state("the engine has shut down"))
    }

    fn set(&self, name: &str, value: Variant) -> Result<()> {
        self.engine.lock()?.variables.set(name, value)
    }
}

impl BurnCore for CoreHandle {
    fn detect(&self) -> Result<()> {
        self.post(EngineCommand::Detect)
    }

    fn plan(&self, action: BundleAction) -> Result<()> {
        self.post(EngineCommand::Plan(action))
    }

    fn apply(&self) -> Result<()> {
        self.post(EngineCommand::Apply)
    }

    fn suspend(&self) {
        tracing::info!("Suspend requested");
        self.engine.flags().suspend.store(true, Ordering::SeqCst);
    }

    fn reboot(&self) {
        tracing::info!("Restart requested");
        let flags = self.engine.flags();
        flags.restart.store(true, Ordering::SeqCst);
        flags.suspend.store(true, Ordering::SeqCst);
    }

    fn get_numeric(&self, name: &str) -> Result<i64> {
        self.engine.lock()?.variables.get_numeric(name)
    }

    fn get_string(&self, name: &str) -> Result<String> {
        self.engine.lock()?.variables.get_string(name)
    }

    fn get_version(&self, name: &str) -> Result<Version> {
        self.engine.lock()?.variables.get_version(name)
    }

    fn set_numeric(&self, name: &str, value: i64) -> Result<()> {
        self.set(name, Variant::Numeric(value))
    }

    fn set_string(&self, name: &str, value: &str) -> Result<()> {
        self.set(name, Variant::String(value.to_string()))
    }

    fn set_version(&self, name: &str, value: Version) -> Result<()> {
        self.set(name, Variant::Version(value))
    }

    fn format_string(&self, template: &str) -> Result<String> {
        Ok(self.engine.lock()?.variables.format_string(template))
    }

    fn evaluate_condition(&self, expression: &str) -> Result<bool> {
        let state = self.engine.lock()?;
        condition::evaluate(expression, &state.variables)
    }

    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::None => {}
            LogLevel::Standard => tracing::info!(target: "burn::ux", "{}", message),
            LogLevel::Verbose => tracing::debug!(target: "burn::ux", "{}", message),
            LogLevel::Debug => tracing::trace!(target: "burn::ux", "{}", message),
            LogLevel::Error => tracing::error!(target: "burn::ux", "{}", message),
        }
    }

    fn quit(&self, status: HResult) -> Result<()> {
        self.post(EngineCommand::Quit(status))
    }
}
