//! Apply: register, cache, execute, and roll back on failure.
//!
//! Apply is the only rollback boundary. Steps that finished are remembered
//! with their rollback action; a vital failure or a cancel undoes them in
//! reverse order before the failure is reported. The failing package itself
//! is not rolled back.
//!
//! Cancel, suspend and restart requests are honoured between packages, never
//! in the middle of one (except that an installer may be told to stop through
//! its progress callback).

use super::{CANCELLED, Engine, EngineState, Operation, PlannedAction, percent};
use crate::cache::PayloadCache;
use crate::config::RestartPolicy;
use crate::elevation::{ElevatedSession, ElevationRequest};
use crate::error::{BurnError, HResult, Result};
use crate::package::invocation::{ExecuteOutcome, Restart};
use crate::package::{InvocationContext, Package, configure_package};
use crate::registration::SessionEnd;
use crate::types::{ActionState, BundleAction, UxCommand};
use crate::variables::Variables;
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;

/// How the execute loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Finished,
    Failed(HResult),
    Cancelled,
    Suspended,
}

/// A step that ran and may need undoing.
struct Executed {
    package: Package,
    rollback: ActionState,
}

impl Engine {
    /// Run Apply. `Err` only when the request is rejected.
    pub fn apply(&self) -> Result<HResult> {
        self.begin(Operation::Apply)?;

        if self.ux.on_apply_begin().is_cancel() {
            tracing::warn!("Apply cancelled before it started");
            self.revert(Operation::Apply);
            self.ux.on_apply_complete(CANCELLED, false);
            return Ok(CANCELLED);
        }

        let (action, plan, bundle_installed) = {
            let state = self.lock()?;
            (state.action, state.plan.clone(), state.bundle_installed)
        };
        tracing::info!("Applying {} ({} step(s))", action, plan.len());

        let status = if action == BundleAction::Layout {
            self.apply_layout()
        } else {
            self.apply_plan(action, &plan, bundle_installed)
        };

        let restart_required = self.restart_required().unwrap_or(false);
        if restart_required {
            self.resolve_restart();
        }

        self.finish(Operation::Apply, status.is_success());
        tracing::info!("Apply finished with {}", status);
        self.ux.on_apply_complete(status, restart_required);
        Ok(status)
    }

    fn apply_layout(&self) -> HResult {
        let packages = match self.lock() {
            Ok(state) => state.packages.clone(),
            Err(e) => return e.hresult(),
        };
        let cache = match &self.layout_dir {
            Some(dir) => PayloadCache::new(self.cache.source_dir(), dir),
            None => self.cache.clone(),
        };
        tracing::info!("Laying out {} payload(s) to {}", packages.len(), cache.cache_dir().display());
        match self.cache_payloads(&cache, &packages) {
            Ok(_) => HResult::S_OK,
            Err(status) => status,
        }
    }

    fn apply_plan(&self, action: BundleAction, plan: &[PlannedAction], bundle_installed: bool) -> HResult {
        // Register
        if self.ux.on_register_begin().is_cancel() {
            self.ux.on_register_complete(CANCELLED);
            return CANCELLED;
        }
        let registered = self.lock().map(|state| state.snapshot()).and_then(|snapshot| {
            self.registration()?
                .session_begin(&self.manifest.registration, &snapshot)
        });
        let status = registered.as_ref().map_or_else(BurnError::hresult, |_| HResult::S_OK);
        if let Err(e) = &registered {
            tracing::error!("Registration failed: {}", e);
        }
        self.ux.on_register_complete(status);
        if status.is_failure() {
            return status;
        }

        // Cache
        let to_cache: Vec<Package> = match self.lock() {
            Ok(state) => plan
                .iter()
                .filter(|step| matches!(step.execute, ActionState::Install | ActionState::Repair))
                .filter_map(|step| state.package(&step.package_id).ok().cloned())
                .collect(),
            Err(e) => return self.end_session(Stop::Failed(e.hresult()), action, bundle_installed),
        };
        let skipped = match self.cache_payloads(&self.cache, &to_cache) {
            Ok(skipped) => skipped,
            Err(status) => {
                let stop = if status == CANCELLED {
                    Stop::Cancelled
                } else {
                    Stop::Failed(status)
                };
                return self.end_session(stop, action, bundle_installed);
            }
        };

        // Elevate
        let mut session = match self.elevate_if_needed(plan) {
            Ok(session) => session,
            Err(e) => {
                tracing::error!("{}", e);
                self.ux.on_error("", e.hresult(), &e.to_string());
                return self.end_session(Stop::Failed(e.hresult()), action, bundle_installed);
            }
        };

        // Execute
        let mut executed = Vec::new();
        let stop = self.execute_plan(plan, &skipped, &mut session, &mut executed);

        if matches!(stop, Stop::Failed(_) | Stop::Cancelled) {
            self.rollback(&mut executed, &mut session);
        }
        let execute_status = stop_status(stop);
        self.ux.on_execute_complete(execute_status);

        if let Some(session) = session {
            let abort = matches!(stop, Stop::Failed(_) | Stop::Cancelled);
            match session.terminate(abort) {
                Ok(status) => tracing::debug!("Elevated session ended with {}", status),
                Err(e) => tracing::warn!("Elevated session did not end cleanly: {}", e),
            }
        }

        self.end_session(stop, action, bundle_installed)
    }

    /// Copy payloads into `cache`. Returns the ids of non-vital packages that
    /// could not be cached; a vital failure fails the whole step.
    fn cache_payloads(&self, cache: &PayloadCache, packages: &[Package]) -> std::result::Result<BTreeSet<String>, HResult> {
        if self.ux.on_cache_begin().is_cancel() {
            self.ux.on_cache_complete(CANCELLED);
            return Err(CANCELLED);
        }

        let mut skipped = BTreeSet::new();
        for package in packages {
            let Err(e) = cache.cache_package(package) else {
                continue;
            };
            tracing::error!("{}", e);
            let status = e.hresult();
            if package.vital {
                self.ux.on_error(&package.id, status, &e.to_string());
                self.ux.on_cache_complete(status);
                return Err(status);
            }
            match self.ux.on_error(&package.id, status, &e.to_string()) {
                UxCommand::Cancel => {
                    self.ux.on_cache_complete(CANCELLED);
                    return Err(CANCELLED);
                }
                _ => {
                    tracing::warn!("Skipping non-vital package {} without a payload", package.id);
                    skipped.insert(package.id.clone());
                }
            }
        }

        self.ux.on_cache_complete(HResult::S_OK);
        Ok(skipped)
    }

    fn elevate_if_needed(&self, plan: &[PlannedAction]) -> Result<Option<Box<dyn ElevatedSession>>> {
        let per_machine = {
            let state = self.lock()?;
            plan.iter().any(|step| {
                state
                    .package(&step.package_id)
                    .is_ok_and(|p| p.per_machine)
            })
        };
        if !per_machine || self.probe.is_privileged() {
            return Ok(None);
        }

        let manifest_path = self.manifest_path.clone().ok_or_else(|| {
            BurnError::elevation("per-machine packages need elevation but the manifest has no path")
        })?;
        tracing::info!("Per-machine packages planned; elevating");
        let request = ElevationRequest {
            manifest_path,
            cache_dir: self.cache.cache_dir().to_path_buf(),
            config_path: self.config_path.clone(),
        };
        self.elevator.elevate(&request).map(Some)
    }

    fn execute_plan(
        &self,
        plan: &[PlannedAction],
        skipped: &BTreeSet<String>,
        session: &mut Option<Box<dyn ElevatedSession>>,
        executed: &mut Vec<Executed>,
    ) -> Stop {
        if self.ux.on_execute_begin(plan.len()).is_cancel() {
            return Stop::Cancelled;
        }

        for (index, step) in plan.iter().enumerate() {
            if self.is_cancelled() {
                tracing::warn!("Cancel requested; stopping before {}", step.package_id);
                return Stop::Cancelled;
            }
            if self.flags.suspend.load(Ordering::SeqCst) {
                tracing::info!("Suspend requested; stopping before {}", step.package_id);
                return Stop::Suspended;
            }
            if skipped.contains(&step.package_id) {
                continue;
            }

            let package = match self.lock().and_then(|state| state.package(&step.package_id).cloned()) {
                Ok(package) => package,
                Err(e) => return Stop::Failed(e.hresult()),
            };

            if self
                .ux
                .on_execute_package_begin(&package.id, step.execute, false)
                .is_cancel()
            {
                return Stop::Cancelled;
            }

            let (outcome, answer) = loop {
                let outcome = self
                    .execute_step(&package, step.execute, false, session)
                    .unwrap_or_else(|e| {
                        tracing::error!("{}", e);
                        ExecuteOutcome::failure(e.hresult())
                    });
                if outcome.is_success() {
                    break (outcome, UxCommand::Ok);
                }
                if outcome.hresult == HResult::E_INSTALL_USEREXIT && self.is_cancelled() {
                    break (outcome, UxCommand::Cancel);
                }
                let message = format!("{} of {} failed", step.execute, package.id);
                match self.ux.on_error(&package.id, outcome.hresult, &message) {
                    UxCommand::Retry => {
                        tracing::info!("Retrying {}", package.id);
                    }
                    answer => break (outcome, answer),
                }
            };
            self.ux
                .on_execute_package_complete(&package.id, outcome.hresult, outcome.restart);

            if outcome.is_success() {
                self.record_success(&package, outcome.restart);
                executed.push(Executed {
                    rollback: step.rollback,
                    package,
                });
            } else if answer == UxCommand::Cancel {
                return Stop::Cancelled;
            } else if package.vital && answer != UxCommand::Ignore {
                tracing::error!(
                    "Vital package {} failed with {}",
                    package.id,
                    outcome.hresult
                );
                return Stop::Failed(outcome.hresult);
            } else {
                tracing::warn!(
                    "Package {} failed with {}; continuing",
                    package.id,
                    outcome.hresult
                );
            }

            if self.ux.on_progress(percent(index + 1, plan.len())).is_cancel() {
                return Stop::Cancelled;
            }
        }
        Stop::Finished
    }

    /// Note a finished step and persist it, so a resumed session skips it.
    fn record_success(&self, package: &Package, restart: Restart) {
        self.persist_progress(&package.id, |state| {
            state.completed.insert(package.id.clone());
            if restart != Restart::None {
                tracing::info!("{} requires a restart", package.id);
                state.restart_required = true;
            }
        });
    }

    /// Note an undone step and persist it, so a resumed session detects it again.
    fn record_rollback(&self, id: &str) {
        self.persist_progress(id, |state| {
            state.completed.remove(id);
        });
    }

    fn persist_progress(&self, id: &str, update: impl FnOnce(&mut EngineState)) {
        let snapshot = match self.lock() {
            Ok(mut state) => {
                update(&mut state);
                state.snapshot()
            }
            Err(e) => {
                tracing::error!("{}", e);
                return;
            }
        };
        if let Err(e) = self.registration().and_then(|mut store| store.save_state(&snapshot)) {
            tracing::warn!("Could not save session state after {}: {}", id, e);
        }
    }

    fn rollback(&self, executed: &mut Vec<Executed>, session: &mut Option<Box<dyn ElevatedSession>>) {
        tracing::warn!("Rolling back {} executed package(s)", executed.len());
        while let Some(step) = executed.pop() {
            if step.rollback.is_none() {
                continue;
            }
            let id = step.package.id.clone();
            self.ux.on_execute_package_begin(&id, step.rollback, true);
            let outcome = self
                .execute_step(&step.package, step.rollback, true, session)
                .unwrap_or_else(|e| ExecuteOutcome::failure(e.hresult()));
            if outcome.is_success() {
                self.record_rollback(&id);
            } else {
                tracing::error!("Rollback of {} failed with {}", id, outcome.hresult);
            }
            self.ux
                .on_execute_package_complete(&id, outcome.hresult, outcome.restart);
        }
    }

    /// Run one action locally or in the elevated companion.
    fn execute_step(
        &self,
        package: &Package,
        action: ActionState,
        rollback: bool,
        session: &mut Option<Box<dyn ElevatedSession>>,
    ) -> Result<ExecuteOutcome> {
        let id = package.id.as_str();
        let mut progress = |percent: u8| -> UxCommand {
            let answer = self.ux.on_execute_progress(id, percent);
            if rollback {
                // A rollback always runs to completion
                return UxCommand::Ok;
            }
            if answer.is_cancel() {
                self.flags.cancel.store(true, Ordering::SeqCst);
            }
            if self.is_cancelled() {
                UxCommand::Cancel
            } else {
                UxCommand::Ok
            }
        };

        match session {
            Some(session) if package.per_machine => {
                let lookup = |name: &str| {
                    let state = self.lock().ok()?;
                    let value = state.variables.get(name)?;
                    Some((value, state.variables.is_hidden(name)))
                };
                session
                    .execute_package(id, action, rollback, &lookup, &mut progress)
                    .map_err(|e| BurnError::configuration(id, e.hresult(), e.to_string()))
            }
            _ => {
                let args = {
                    let state = self.lock()?;
                    let mut source: &Variables = &state.variables;
                    let mut ctx = InvocationContext {
                        config: &self.config,
                        cache_dir: self.cache.cache_dir(),
                        variables: &mut source,
                    };
                    configure_package(package, action, &mut ctx)?
                };
                self.runner.run(args.as_ref(), &mut progress)
            }
        }
    }

    /// Settle registration for how the session ended; returns the final status.
    fn end_session(&self, stop: Stop, action: BundleAction, bundle_installed: bool) -> HResult {
        let status = stop_status(stop);
        let result = self.finalize_registration(stop, action, bundle_installed);
        match result {
            Ok(()) => status,
            Err(e) => {
                tracing::error!("Could not finalize registration: {}", e);
                if status.is_success() { e.hresult() } else { status }
            }
        }
    }

    fn finalize_registration(&self, stop: Stop, action: BundleAction, bundle_installed: bool) -> Result<()> {
        let (snapshot, restart_required) = {
            let state = self.lock()?;
            (state.snapshot(), state.restart_required)
        };
        let restart_wanted = self.flags.restart.load(Ordering::SeqCst);
        let mut store = self.registration()?;

        match stop {
            Stop::Suspended if restart_wanted => {
                store.session_suspend(&snapshot, self.boot_id().as_deref())
            }
            Stop::Suspended => store.session_suspend(&snapshot, None),
            Stop::Finished if restart_required => {
                store.session_suspend(&snapshot, self.boot_id().as_deref())
            }
            Stop::Finished if action == BundleAction::Uninstall => {
                store.session_end(SessionEnd::Remove)?;
                drop(store);
                self.cache.purge()
            }
            Stop::Finished => store.session_end(SessionEnd::Keep),
            Stop::Failed(_) | Stop::Cancelled if bundle_installed => {
                store.session_end(SessionEnd::Keep)
            }
            Stop::Failed(_) | Stop::Cancelled => {
                store.session_end(SessionEnd::Remove)?;
                drop(store);
                self.cache.purge()
            }
        }
    }

    /// Decide, per the restart policy, whether to restart at shutdown.
    fn resolve_restart(&self) {
        let restart = match self.config.restart {
            RestartPolicy::Never => false,
            RestartPolicy::Always => true,
            RestartPolicy::Prompt => self.ux.on_restart_required() == UxCommand::Restart,
        };
        if restart {
            tracing::info!("Restart will be initiated at shutdown");
            self.flags.restart.store(true, Ordering::SeqCst);
        } else {
            tracing::warn!("A restart is required to complete the bundle");
        }
    }
}

fn stop_status(stop: Stop) -> HResult {
    match stop {
        Stop::Finished | Stop::Suspended => HResult::S_OK,
        Stop::Failed(status) => status,
        Stop::Cancelled => CANCELLED,
    }
}
