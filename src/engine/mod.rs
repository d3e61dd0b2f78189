//! The bundle engine: Detect, Plan and Apply over one manifest.
//!
//! `Engine` is the single context object. Everything Detect/Plan/Apply
//! mutate lives in `EngineState` behind one mutex; the lock is taken around
//! mutation and released before every UX callback, so a UX may read
//! variables or post the next request from inside any callback.
//!
//! Requests reach the engine through a `CoreHandle` (see [`facade`]) and are
//! run one at a time on the engine thread owned by [`host::EngineHost`].

mod apply;
pub mod facade;
mod detect;
pub mod host;
pub mod phase;
pub mod plan;

pub use facade::{BurnCore, CoreHandle, EngineCommand};
pub use host::{EngineHost, RunSummary};
pub use phase::{EnginePhase, Operation, PhaseMachine, PhaseTransitionError};
pub use plan::{PlannedAction, order_plan};

use crate::cache::PayloadCache;
use crate::config::EngineConfig;
use crate::elevation::{Elevator, ProcessElevator};
use crate::error::{BurnError, HResult, Result};
use crate::manifest::Manifest;
use crate::package::Package;
use crate::registration::{FileRegistrationStore, RegistrationStore};
use crate::runner::{PackageRunner, ProcessRunner};
use crate::state::{EngineSnapshot, PackageSnapshot};
use crate::system::{HostSystem, SystemProbe};
use crate::types::{BundleAction, PackageState, ResumeType};
use crate::ux::UserExperience;
use crate::variables::{Variables, Variant, builtin};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Requests observed at package boundaries.
#[derive(Debug, Default)]
pub struct EngineFlags {
    pub cancel: Arc<AtomicBool>,
    pub suspend: AtomicBool,
    /// The UX asked for a machine restart when the engine shuts down
    pub restart: AtomicBool,
}

/// Everything Detect, Plan and Apply read and write.
#[derive(Debug)]
pub(crate) struct EngineState {
    pub action: BundleAction,
    pub resume_type: ResumeType,
    pub variables: Variables,
    pub packages: Vec<Package>,
    pub plan: Vec<PlannedAction>,
    /// Packages whose execute action finished in this session
    pub completed: BTreeSet<String>,
    /// State blob of the interrupted session this run resumes
    pub resume_snapshot: Option<EngineSnapshot>,
    pub restart_required: bool,
    pub bundle_installed: bool,
    pub phase: PhaseMachine,
}

impl EngineState {
    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            action: self.action,
            restart_required: self.restart_required,
            variables: self.variables.persistable(),
            packages: self
                .packages
                .iter()
                .map(|p| PackageSnapshot::of(p, self.completed.contains(&p.id)))
                .collect(),
        }
    }

    fn package(&self, id: &str) -> Result<&Package> {
        self.packages
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| BurnError::state(format!("no package '{}' in the chain", id)))
    }
}

pub struct Engine {
    manifest: Manifest,
    config: EngineConfig,
    state: Mutex<EngineState>,
    flags: EngineFlags,
    ux: Arc<dyn UserExperience>,
    probe: Arc<dyn SystemProbe>,
    runner: Arc<dyn PackageRunner>,
    elevator: Arc<dyn Elevator>,
    registration: Mutex<Box<dyn RegistrationStore>>,
    cache: PayloadCache,
    layout_dir: Option<PathBuf>,
    manifest_path: Option<PathBuf>,
    config_path: Option<PathBuf>,
}

/// Assembles an engine; every collaborator except the UX has a default.
pub struct EngineBuilder {
    manifest: Manifest,
    config: EngineConfig,
    ux: Option<Arc<dyn UserExperience>>,
    probe: Option<Arc<dyn SystemProbe>>,
    runner: Option<Arc<dyn PackageRunner>>,
    elevator: Option<Arc<dyn Elevator>>,
    registration: Option<Box<dyn RegistrationStore>>,
    source_dir: Option<PathBuf>,
    layout_dir: Option<PathBuf>,
    manifest_path: Option<PathBuf>,
    config_path: Option<PathBuf>,
}

impl EngineBuilder {
    pub fn ux(mut self, ux: Arc<dyn UserExperience>) -> Self {
        self.ux = Some(ux);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn SystemProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn runner(mut self, runner: Arc<dyn PackageRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn elevator(mut self, elevator: Arc<dyn Elevator>) -> Self {
        self.elevator = Some(elevator);
        self
    }

    pub fn registration(mut self, store: Box<dyn RegistrationStore>) -> Self {
        self.registration = Some(store);
        self
    }

    /// Directory the payloads are copied from. Defaults to the manifest's
    /// directory.
    pub fn source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = Some(dir.into());
        self
    }

    /// Destination of the Layout action. Defaults to the bundle cache.
    pub fn layout_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.layout_dir = Some(dir.into());
        self
    }

    /// Where the manifest was loaded from; the elevated companion reloads it.
    pub fn manifest_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest_path = Some(path.into());
        self
    }

    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<Arc<Engine>> {
        let ux = self
            .ux
            .ok_or_else(|| BurnError::config("an engine needs a user experience"))?;
        let bundle_id = self.manifest.registration.id.clone();
        let probe = self.probe.unwrap_or_else(|| Arc::new(HostSystem));
        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(ProcessRunner::default()));
        let elevator = self.elevator.unwrap_or_else(|| {
            Arc::new(ProcessElevator::new(
                self.config.elevation_launcher.clone(),
                self.config.pipe_timeout(),
            ))
        });
        let registration = self.registration.unwrap_or_else(|| {
            Box::new(FileRegistrationStore::new(
                self.config.registration_dir(&bundle_id),
            ))
        });
        let source_dir = self
            .source_dir
            .or_else(|| {
                self.manifest_path
                    .as_deref()
                    .and_then(Path::parent)
                    .map(Path::to_path_buf)
            })
            .unwrap_or_else(|| PathBuf::from("."));
        let cache = PayloadCache::new(source_dir, self.config.cache_dir(&bundle_id));

        let state = initial_state(&self.manifest, probe.as_ref(), registration.as_ref())?;

        Ok(Arc::new(Engine {
            manifest: self.manifest,
            config: self.config,
            state: Mutex::new(state),
            flags: EngineFlags::default(),
            ux,
            probe,
            runner,
            elevator,
            registration: Mutex::new(registration),
            cache,
            layout_dir: self.layout_dir,
            manifest_path: self.manifest_path,
            config_path: self.config_path,
        }))
    }
}

/// Variables, packages and resume information as the engine starts.
fn initial_state(
    manifest: &Manifest,
    probe: &dyn SystemProbe,
    registration: &dyn RegistrationStore,
) -> Result<EngineState> {
    let mut variables = manifest.initial_variables()?;
    let boot_id = probe.boot_session_id();
    let mut resume_type = registration.detect_resume_type(boot_id.as_deref());

    let bundle_installed = match registration.record() {
        Ok(Some(record)) => record.installed,
        _ => false,
    };

    let resume_snapshot = if resume_type.restores_state() {
        match registration.load_state() {
            Ok(Some(snapshot)) => {
                if let Err(e) = variables.restore(&snapshot.variables) {
                    tracing::warn!("Could not restore saved variables: {}", e);
                }
                Some(snapshot)
            }
            Ok(None) => {
                tracing::warn!("Resume type {} but no saved state", resume_type);
                None
            }
            Err(e) => {
                tracing::warn!("Saved state unreadable, starting fresh: {}", e);
                resume_type = ResumeType::Invalid;
                None
            }
        }
    } else {
        None
    };
    tracing::info!(
        "Bundle {} {} (resume: {}, installed: {})",
        manifest.registration.name,
        manifest.registration.version,
        resume_type,
        bundle_installed
    );

    variables.set_builtin(
        builtin::BUNDLE_INSTALLED,
        Variant::Numeric(i64::from(bundle_installed)),
    );
    variables.set_builtin(
        builtin::PRIVILEGED,
        Variant::Numeric(i64::from(probe.is_privileged())),
    );
    variables.set_builtin(
        builtin::REBOOT_PENDING,
        Variant::Numeric(i64::from(resume_type == ResumeType::RebootPending)),
    );

    Ok(EngineState {
        action: resume_snapshot
            .as_ref()
            .map(|s| s.action)
            .unwrap_or_default(),
        resume_type,
        variables,
        packages: manifest.packages.clone(),
        plan: Vec::new(),
        completed: resume_snapshot
            .iter()
            .flat_map(|s| &s.packages)
            .filter(|p| p.completed)
            .map(|p| p.id.clone())
            .collect(),
        // The restart a previous session asked for has happened once the boot changed
        restart_required: resume_type != ResumeType::Reboot
            && resume_snapshot
                .as_ref()
                .is_some_and(|s| s.restart_required),
        resume_snapshot,
        bundle_installed,
        phase: PhaseMachine::new(),
    })
}

impl Engine {
    pub fn builder(manifest: Manifest, config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            manifest,
            config,
            ux: None,
            probe: None,
            runner: None,
            elevator: None,
            registration: None,
            source_dir: None,
            layout_dir: None,
            manifest_path: None,
            config_path: None,
        }
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, EngineState>> {
        self.state
            .lock()
            .map_err(|_| BurnError::state("engine state lock poisoned"))
    }

    fn registration(&self) -> Result<MutexGuard<'_, Box<dyn RegistrationStore>>> {
        self.registration
            .lock()
            .map_err(|_| BurnError::state("registration lock poisoned"))
    }

    pub(crate) fn ux(&self) -> &Arc<dyn UserExperience> {
        &self.ux
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn flags(&self) -> &EngineFlags {
        &self.flags
    }

    /// Flag set by signal handlers to cancel at the next package boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flags.cancel)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.flags.cancel.load(Ordering::SeqCst)
    }

    /// Start `op` if the phase allows it.
    fn begin(&self, op: Operation) -> Result<()> {
        self.lock()?.phase.begin(op)?;
        Ok(())
    }

    fn finish(&self, op: Operation, success: bool) {
        let result = match self.lock() {
            Ok(mut state) if success => state.phase.complete(op),
            Ok(mut state) => state.phase.abandon(op, op == Operation::Apply),
            Err(e) => {
                tracing::error!("Cannot record end of {}: {}", op, e);
                return;
            }
        };
        if let Err(e) = result {
            tracing::error!("Phase bookkeeping failed: {}", e);
        }
    }

    /// Put the phase back where `op` started from (cancelled before any change).
    fn revert(&self, op: Operation) {
        match self.lock() {
            Ok(mut state) => {
                if let Err(e) = state.phase.abandon(op, false) {
                    tracing::error!("Phase bookkeeping failed: {}", e);
                }
            }
            Err(e) => tracing::error!("Cannot revert {}: {}", op, e),
        }
    }

    /// Check, without starting it, that `op` could run now.
    pub fn check(&self, op: Operation) -> Result<()> {
        self.lock()?.phase.check(op)?;
        Ok(())
    }

    pub fn phase(&self) -> Result<EnginePhase> {
        Ok(self.lock()?.phase.current())
    }

    pub fn resume_type(&self) -> Result<ResumeType> {
        Ok(self.lock()?.resume_type)
    }

    /// Action of the interrupted session this run resumes, if any.
    pub fn resumed_action(&self) -> Result<Option<BundleAction>> {
        Ok(self.lock()?.resume_snapshot.as_ref().map(|s| s.action))
    }

    pub fn package_state(&self, id: &str) -> Result<PackageState> {
        Ok(self.lock()?.package(id)?.current)
    }

    /// Copy of one package as Detect and Plan left it.
    pub fn package(&self, id: &str) -> Result<Package> {
        Ok(self.lock()?.package(id)?.clone())
    }

    /// The ordered execute plan.
    pub fn planned_actions(&self) -> Result<Vec<PlannedAction>> {
        Ok(self.lock()?.plan.clone())
    }

    pub fn restart_required(&self) -> Result<bool> {
        Ok(self.lock()?.restart_required)
    }

    pub fn snapshot(&self) -> Result<EngineSnapshot> {
        Ok(self.lock()?.snapshot())
    }

    pub(crate) fn boot_id(&self) -> Option<String> {
        self.probe.boot_session_id()
    }

    /// Tell the UX a request could not be run, through the Complete callback
    /// of the phase it asked for.
    pub(crate) fn report_rejected(&self, op: Operation, err: &BurnError) {
        tracing::error!("{} request rejected: {}", op, err);
        let status = err.hresult();
        match op {
            Operation::Detect => self.ux.on_detect_complete(status),
            Operation::Plan => self.ux.on_plan_complete(status),
            Operation::Apply => {
                let restart = self.restart_required().unwrap_or(false);
                self.ux.on_apply_complete(status, restart)
            }
        }
    }
}

/// Overall percentage after `done` of `total` steps.
fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        100
    } else {
        u8::try_from(done.min(total) * 100 / total).unwrap_or(100)
    }
}

/// Status for a phase that ended through a UX Cancel.
const CANCELLED: HResult = HResult::E_INSTALL_USEREXIT;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 4), 0);
        assert_eq!(percent(1, 4), 25);
        assert_eq!(percent(4, 4), 100);
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(9, 4), 100);
    }
}
