//! User experience callbacks
//!
//! A UX is told about every step of the lifecycle and answers Begin callbacks
//! (and progress) with a `UxCommand`; answering Cancel cancels the phase.
//! Every method has a default, so a UX only implements what it shows.
//!
//! Callbacks run on the engine thread with no engine lock held, so a UX may
//! call back into the core (read variables, post the next request) from any
//! callback.

use crate::engine::{BurnCore, CoreHandle};
use crate::error::HResult;
use crate::package::invocation::Restart;
use crate::types::{ActionState, BundleAction, PackageState, RequestState, ResumeType, UxCommand};
use std::sync::Mutex;

/// Plan result for one package, as reported to the UX.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedPackage {
    pub current: PackageState,
    pub requested: RequestState,
    pub execute: ActionState,
    pub rollback: ActionState,
}

#[allow(unused_variables)]
pub trait UserExperience: Send + Sync {
    /// The engine is ready; `core` stays valid until `on_shutdown`.
    fn on_startup(&self, core: CoreHandle) {}

    fn on_shutdown(&self) {}

    fn on_detect_begin(&self, resume: ResumeType, package_count: usize) -> UxCommand {
        UxCommand::Ok
    }

    fn on_detect_package_begin(&self, package_id: &str) -> UxCommand {
        UxCommand::Ok
    }

    fn on_detect_package_complete(&self, package_id: &str, status: HResult, state: PackageState) {}

    fn on_detect_complete(&self, status: HResult) {}

    fn on_plan_begin(&self, package_count: usize) -> UxCommand {
        UxCommand::Ok
    }

    /// `requested` holds the engine's default; the UX may change it.
    fn on_plan_package_begin(&self, package_id: &str, requested: &mut RequestState) -> UxCommand {
        UxCommand::Ok
    }

    fn on_plan_package_complete(&self, package_id: &str, status: HResult, plan: &PlannedPackage) {}

    fn on_plan_complete(&self, status: HResult) {}

    fn on_apply_begin(&self) -> UxCommand {
        UxCommand::Ok
    }

    fn on_register_begin(&self) -> UxCommand {
        UxCommand::Ok
    }

    fn on_register_complete(&self, status: HResult) {}

    fn on_cache_begin(&self) -> UxCommand {
        UxCommand::Ok
    }

    fn on_cache_complete(&self, status: HResult) {}

    fn on_execute_begin(&self, package_count: usize) -> UxCommand {
        UxCommand::Ok
    }

    fn on_execute_package_begin(&self, package_id: &str, action: ActionState, rollback: bool) -> UxCommand {
        UxCommand::Ok
    }

    fn on_execute_progress(&self, package_id: &str, percent: u8) -> UxCommand {
        UxCommand::Ok
    }

    fn on_execute_package_complete(&self, package_id: &str, status: HResult, restart: Restart) {}

    fn on_execute_complete(&self, status: HResult) {}

    /// A package failed. Retry runs it again, Ignore treats it as non-vital,
    /// Cancel stops the apply.
    fn on_error(&self, package_id: &str, status: HResult, message: &str) -> UxCommand {
        UxCommand::Ok
    }

    /// Overall progress through the execute plan.
    fn on_progress(&self, percent: u8) -> UxCommand {
        UxCommand::Ok
    }

    /// Answer Restart to have the machine restarted at shutdown.
    fn on_restart_required(&self) -> UxCommand {
        UxCommand::Ok
    }

    fn on_apply_complete(&self, status: HResult, restart_required: bool) {}
}

/// Headless UX: runs Detect, Plan(action), Apply and quits, logging each step.
pub struct ConsoleUx {
    action: BundleAction,
    allow_restart: bool,
    core: Mutex<Option<CoreHandle>>,
}

impl ConsoleUx {
    pub fn new(action: BundleAction, allow_restart: bool) -> Self {
        Self {
            action,
            allow_restart,
            core: Mutex::new(None),
        }
    }

    fn with_core(&self, f: impl FnOnce(&CoreHandle)) {
        let guard = match self.core.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(core) = guard.as_ref() {
            f(core);
        }
    }

    /// Post the next request, or quit with its rejection status.
    fn next(&self, status: HResult, step: impl FnOnce(&CoreHandle) -> crate::error::Result<()>) {
        self.with_core(|core| {
            let result = if status.is_success() {
                step(core).map_err(|e| e.hresult())
            } else {
                Err(status)
            };
            if let Err(status) = result {
                if let Err(e) = core.quit(status) {
                    tracing::error!("Failed to post quit: {}", e);
                }
            }
        });
    }
}

impl UserExperience for ConsoleUx {
    fn on_startup(&self, core: CoreHandle) {
        tracing::info!("Starting {}", self.action);
        match self.core.lock() {
            Ok(mut guard) => *guard = Some(core),
            Err(poisoned) => *poisoned.into_inner() = Some(core),
        }
        self.next(HResult::S_OK, |core| core.detect());
    }

    fn on_detect_begin(&self, resume: ResumeType, package_count: usize) -> UxCommand {
        tracing::info!("Detecting {} package(s) (resume: {})", package_count, resume);
        UxCommand::Ok
    }

    fn on_detect_package_complete(&self, package_id: &str, status: HResult, state: PackageState) {
        if status.is_success() {
            tracing::info!("Detected {}: {}", package_id, state);
        } else {
            tracing::warn!("Detection of {} failed ({}), state {}", package_id, status, state);
        }
    }

    fn on_detect_complete(&self, status: HResult) {
        self.next(status, |core| {
            // A resumed session finishes what it started
            let action = match core.engine().resumed_action() {
                Ok(Some(resumed)) if resumed != self.action => {
                    tracing::info!("Resuming {} instead of {}", resumed, self.action);
                    resumed
                }
                _ => self.action,
            };
            core.plan(action)
        });
    }

    fn on_plan_package_complete(&self, package_id: &str, _status: HResult, plan: &PlannedPackage) {
        tracing::info!(
            "Planned {}: {} -> {} (execute {}, rollback {})",
            package_id,
            plan.current,
            plan.requested,
            plan.execute,
            plan.rollback
        );
    }

    fn on_plan_complete(&self, status: HResult) {
        self.next(status, |core| core.apply());
    }

    fn on_execute_package_begin(&self, package_id: &str, action: ActionState, rollback: bool) -> UxCommand {
        if rollback {
            tracing::warn!("Rolling back {} ({})", package_id, action);
        } else {
            tracing::info!("Applying {} ({})", package_id, action);
        }
        UxCommand::Ok
    }

    fn on_execute_package_complete(&self, package_id: &str, status: HResult, restart: Restart) {
        tracing::info!("{} finished with {} (restart {:?})", package_id, status, restart);
    }

    fn on_error(&self, package_id: &str, status: HResult, message: &str) -> UxCommand {
        tracing::error!("{} failed with {}: {}", package_id, status, message);
        UxCommand::Ok
    }

    fn on_progress(&self, percent: u8) -> UxCommand {
        tracing::info!("Progress {}%", percent);
        UxCommand::Ok
    }

    fn on_restart_required(&self) -> UxCommand {
        if self.allow_restart {
            UxCommand::Restart
        } else {
            tracing::warn!("A restart is required to finish");
            UxCommand::Ok
        }
    }

    fn on_apply_complete(&self, status: HResult, restart_required: bool) {
        if status.is_success() {
            tracing::info!("{} complete (restart required: {})", self.action, restart_required);
        } else {
            tracing::error!("{} failed with {}", self.action, status);
        }
        self.with_core(|core| {
            if let Err(e) = core.quit(status) {
                tracing::error!("Failed to post quit: {}", e);
            }
        });
    }

    fn on_shutdown(&self) {
        match self.core.lock() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }
}
