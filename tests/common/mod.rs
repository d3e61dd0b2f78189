// Shared fixtures for the engine integration tests.
//
// FakeSystem answers Detect from a table of installed products, RecordingRunner
// stands in for msiexec and RecordingUx drives Detect -> Plan -> Apply -> Quit
// through the core handle while recording every callback.

#![allow(dead_code)]

use burn_engine::config::{EngineConfig, RestartPolicy};
use burn_engine::elevation::companion::{CompanionOptions, run_companion};
use burn_engine::elevation::pipe::Pipe;
use burn_engine::elevation::{ElevatedSession, ElevationRequest, Elevator, PipeSession, new_secret};
use burn_engine::engine::{BurnCore, CoreHandle, Engine};
use burn_engine::error::{HResult, Result};
use burn_engine::manifest::Manifest;
use burn_engine::package::invocation::{ExecuteOutcome, InstallerArgs, Restart};
use burn_engine::registration::FileRegistrationStore;
use burn_engine::runner::{PackageRunner, ProgressFn};
use burn_engine::system::{RegistryRoot, RelatedProduct, SystemProbe};
use burn_engine::types::{ActionState, BundleAction, PackageState, RequestState, ResumeType, UxCommand};
use burn_engine::ux::{PlannedPackage, UserExperience};
use burn_engine::variables::Variant;
use burn_engine::version::Version;
use std::collections::{HashMap, VecDeque};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const BUNDLE_ID: &str = "{2C5B0B3A-8A4C-4E28-9D4B-55B0C1D2E3F4}";

/// Normalized product code of test package number `n`.
pub fn product_code(n: u32) -> String {
    format!("{{{:08X}-1111-2222-3333-444455556666}}", n)
}

/// `<MsiPackage>` element for test package number `n`, version 1.0.0.0.
pub fn msi(id: &str, n: u32, extra: &str) -> String {
    format!(
        r#"<MsiPackage Id="{id}" FileName="{file}.msi" ProductCode="{code}" ProductVersion="1.0.0.0" {extra}/>"#,
        id = id,
        file = id.to_lowercase(),
        code = product_code(n),
        extra = extra
    )
}

// ============================================================================
// System probe
// ============================================================================

#[derive(Default)]
pub struct FakeSystem {
    products: Mutex<HashMap<String, Version>>,
    privileged: bool,
    boot_id: Mutex<Option<String>>,
}

impl FakeSystem {
    pub fn new() -> Self {
        Self {
            privileged: true,
            boot_id: Mutex::new(Some("boot-1".to_string())),
            ..Default::default()
        }
    }

    pub fn unprivileged() -> Self {
        Self {
            privileged: false,
            ..Self::new()
        }
    }

    pub fn install(&self, n: u32) {
        self.products
            .lock()
            .unwrap()
            .insert(product_code(n), Version::new(1, 0, 0, 0));
    }

    pub fn set_boot_id(&self, id: &str) {
        *self.boot_id.lock().unwrap() = Some(id.to_string());
    }
}

impl SystemProbe for FakeSystem {
    fn msi_product_version(&self, product_code: &str) -> Result<Option<Version>> {
        Ok(self.products.lock().unwrap().get(product_code).copied())
    }

    fn msi_related_products(&self, _upgrade_code: &str) -> Result<Vec<RelatedProduct>> {
        Ok(Vec::new())
    }

    fn qfe_installed(&self, _kb: &str) -> Result<bool> {
        Ok(false)
    }

    fn registry_value(
        &self,
        _root: RegistryRoot,
        _key: &str,
        _value: Option<&str>,
    ) -> Result<Option<Variant>> {
        Ok(None)
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn file_version(&self, _path: &Path) -> Result<Option<Version>> {
        Ok(None)
    }

    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn boot_session_id(&self) -> Option<String> {
        self.boot_id.lock().unwrap().clone()
    }
}

// ============================================================================
// Installer runner
// ============================================================================

/// One installer invocation as the runner saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub package_id: String,
    pub args: Vec<String>,
}

impl Call {
    /// The msiexec verb: "install", "uninstall" or "repair".
    pub fn verb(&self) -> &'static str {
        match self.args.first().map(String::as_str) {
            Some("/i") => "install",
            Some("/x") => "uninstall",
            Some("/fvomus") => "repair",
            _ => "other",
        }
    }
}

/// Records invocations and answers each one from a per-package script
/// (success once the script runs out).
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<Call>>,
    script: Mutex<HashMap<String, VecDeque<ExecuteOutcome>>>,
}

impl RecordingRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, package_id: &str, outcomes: &[ExecuteOutcome]) {
        self.script
            .lock()
            .unwrap()
            .entry(package_id.to_string())
            .or_default()
            .extend(outcomes.iter().copied());
    }

    pub fn fail(&self, package_id: &str) {
        self.script(package_id, &[ExecuteOutcome::failure(HResult::E_INSTALL_FAILURE)]);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// `"<id>:<verb>"` for every invocation, in order.
    pub fn trace(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|c| format!("{}:{}", c.package_id, c.verb()))
            .collect()
    }
}

impl PackageRunner for RecordingRunner {
    fn run(&self, args: &dyn InstallerArgs, progress: &mut ProgressFn<'_>) -> Result<ExecuteOutcome> {
        let package_id = args.package_id().to_string();
        self.calls.lock().unwrap().push(Call {
            package_id: package_id.clone(),
            args: args.to_cli_args(),
        });

        if progress(50) == UxCommand::Cancel {
            return Ok(ExecuteOutcome::failure(HResult::E_INSTALL_USEREXIT));
        }
        let outcome = self
            .script
            .lock()
            .unwrap()
            .get_mut(&package_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(ExecuteOutcome::success);
        progress(100);
        Ok(outcome)
    }
}

// ============================================================================
// User experience
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DetectBegin(ResumeType),
    DetectPackage(String, PackageState),
    DetectComplete(HResult),
    PlanPackage(String, ActionState, ActionState),
    PlanComplete(HResult),
    ApplyBegin,
    RegisterComplete(HResult),
    CacheComplete(HResult),
    Execute {
        id: String,
        action: ActionState,
        rollback: bool,
    },
    PackageComplete(String, HResult),
    Error(String, HResult),
    ExecuteComplete(HResult),
    RestartRequired,
    ApplyComplete(HResult, bool),
}

/// How the recording UX answers.
#[derive(Default)]
pub struct UxScript {
    /// Answers to `on_error`, in order; Ok once exhausted
    pub error_answers: Vec<UxCommand>,
    /// Answer Cancel to progress reported for this package
    pub cancel_during: Option<String>,
    /// Call `suspend()` when this package completes
    pub suspend_after: Option<String>,
    /// Call `reboot()` when this package completes
    pub reboot_after: Option<String>,
    /// Requested-state overrides applied in `on_plan_package_begin`
    pub requests: HashMap<String, RequestState>,
    pub restart_answer: Option<UxCommand>,
}

pub struct RecordingUx {
    action: BundleAction,
    script: UxScript,
    error_answers: Mutex<VecDeque<UxCommand>>,
    core: Mutex<Option<CoreHandle>>,
    events: Mutex<Vec<Event>>,
}

impl RecordingUx {
    pub fn new(action: BundleAction, script: UxScript) -> Arc<Self> {
        Arc::new(Self {
            action,
            error_answers: Mutex::new(script.error_answers.iter().copied().collect()),
            script,
            core: Mutex::new(None),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn with_core(&self, f: impl FnOnce(&CoreHandle)) {
        if let Some(core) = self.core.lock().unwrap().as_ref() {
            f(core);
        }
    }

    fn next(&self, status: HResult, step: impl FnOnce(&CoreHandle) -> Result<()>) {
        self.with_core(|core| {
            let status = if status.is_success() {
                match step(core) {
                    Ok(()) => return,
                    Err(e) => e.hresult(),
                }
            } else {
                status
            };
            core.quit(status).unwrap();
        });
    }

    /// Position of the first event matching `pred`.
    pub fn position(&self, pred: impl Fn(&Event) -> bool) -> Option<usize> {
        self.events().iter().position(pred)
    }

    /// Execute/rollback callbacks as `"<id>:<action>"`, rollbacks prefixed `rollback:`.
    pub fn executions(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Execute {
                    id,
                    action,
                    rollback: false,
                } => Some(format!("{}:{}", id, action)),
                Event::Execute {
                    id,
                    action,
                    rollback: true,
                } => Some(format!("rollback:{}:{}", id, action)),
                _ => None,
            })
            .collect()
    }
}

impl UserExperience for RecordingUx {
    fn on_startup(&self, core: CoreHandle) {
        *self.core.lock().unwrap() = Some(core);
        self.next(HResult::S_OK, |core| core.detect());
    }

    fn on_shutdown(&self) {
        *self.core.lock().unwrap() = None;
    }

    fn on_detect_begin(&self, resume: ResumeType, _package_count: usize) -> UxCommand {
        self.push(Event::DetectBegin(resume));
        UxCommand::Ok
    }

    fn on_detect_package_complete(&self, package_id: &str, _status: HResult, state: PackageState) {
        self.push(Event::DetectPackage(package_id.to_string(), state));
    }

    fn on_detect_complete(&self, status: HResult) {
        self.push(Event::DetectComplete(status));
        let action = self.action;
        self.next(status, |core| core.plan(action));
    }

    fn on_plan_package_begin(&self, package_id: &str, requested: &mut RequestState) -> UxCommand {
        if let Some(request) = self.script.requests.get(package_id) {
            *requested = *request;
        }
        UxCommand::Ok
    }

    fn on_plan_package_complete(&self, package_id: &str, _status: HResult, plan: &PlannedPackage) {
        self.push(Event::PlanPackage(
            package_id.to_string(),
            plan.execute,
            plan.rollback,
        ));
    }

    fn on_plan_complete(&self, status: HResult) {
        self.push(Event::PlanComplete(status));
        self.next(status, |core| core.apply());
    }

    fn on_apply_begin(&self) -> UxCommand {
        self.push(Event::ApplyBegin);
        UxCommand::Ok
    }

    fn on_register_complete(&self, status: HResult) {
        self.push(Event::RegisterComplete(status));
    }

    fn on_cache_complete(&self, status: HResult) {
        self.push(Event::CacheComplete(status));
    }

    fn on_execute_package_begin(&self, package_id: &str, action: ActionState, rollback: bool) -> UxCommand {
        self.push(Event::Execute {
            id: package_id.to_string(),
            action,
            rollback,
        });
        UxCommand::Ok
    }

    fn on_execute_progress(&self, package_id: &str, _percent: u8) -> UxCommand {
        if self.script.cancel_during.as_deref() == Some(package_id) {
            UxCommand::Cancel
        } else {
            UxCommand::Ok
        }
    }

    fn on_execute_package_complete(&self, package_id: &str, status: HResult, _restart: Restart) {
        self.push(Event::PackageComplete(package_id.to_string(), status));
        if self.script.suspend_after.as_deref() == Some(package_id) {
            self.with_core(|core| core.suspend());
        }
        if self.script.reboot_after.as_deref() == Some(package_id) {
            self.with_core(|core| core.reboot());
        }
    }

    fn on_error(&self, package_id: &str, status: HResult, _message: &str) -> UxCommand {
        self.push(Event::Error(package_id.to_string(), status));
        self.error_answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(UxCommand::Ok)
    }

    fn on_execute_complete(&self, status: HResult) {
        self.push(Event::ExecuteComplete(status));
    }

    fn on_restart_required(&self) -> UxCommand {
        self.push(Event::RestartRequired);
        self.script.restart_answer.unwrap_or(UxCommand::Ok)
    }

    fn on_apply_complete(&self, status: HResult, restart_required: bool) {
        self.push(Event::ApplyComplete(status, restart_required));
        self.with_core(|core| core.quit(status).unwrap());
    }
}

// ============================================================================
// Elevation through an in-process companion
// ============================================================================

/// Runs the real companion loop on a thread, connected over a socket pair.
pub struct CompanionElevator {
    manifest: Manifest,
    config: EngineConfig,
    runner: Arc<RecordingRunner>,
    elevations: AtomicUsize,
}

impl CompanionElevator {
    pub fn new(manifest: Manifest, config: EngineConfig, runner: Arc<RecordingRunner>) -> Arc<Self> {
        Arc::new(Self {
            manifest,
            config,
            runner,
            elevations: AtomicUsize::new(0),
        })
    }

    pub fn elevations(&self) -> usize {
        self.elevations.load(Ordering::SeqCst)
    }
}

impl Elevator for CompanionElevator {
    fn elevate(&self, request: &ElevationRequest) -> Result<Box<dyn ElevatedSession>> {
        self.elevations.fetch_add(1, Ordering::SeqCst);
        let (parent, child) = UnixStream::pair()?;
        let secret = new_secret();

        let options = CompanionOptions {
            secret: secret.clone(),
            manifest: self.manifest.clone(),
            config: self.config.clone(),
            cache_dir: request.cache_dir.clone(),
            runner: self.runner.clone(),
            timeout: Duration::from_secs(10),
        };
        let child_reader = child.try_clone()?;
        std::thread::spawn(move || run_companion(child_reader, child, options));

        let pipe = Pipe::new(parent.try_clone()?, parent, Duration::from_secs(10))?;
        Ok(Box::new(PipeSession::connect(pipe, &secret, None)?))
    }
}

// ============================================================================
// Bundle fixture
// ============================================================================

/// Temporary data, registration and payload directories for one bundle.
pub struct Fixture {
    pub dir: TempDir,
    pub config: EngineConfig,
    pub source: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        std::fs::create_dir_all(&source).unwrap();
        let config = EngineConfig {
            registration_root: dir.path().join("registration"),
            cache_root: dir.path().join("cache"),
            restart: RestartPolicy::Never,
            ..EngineConfig::default()
        };
        Self {
            dir,
            config,
            source,
        }
    }

    /// Parse a bundle around `chain` and write a payload for every package.
    pub fn manifest(&self, chain: &str) -> Manifest {
        self.manifest_with(chain, "")
    }

    /// Like [`Fixture::manifest`], with extra top-level elements (variables, searches).
    pub fn manifest_with(&self, chain: &str, extra: &str) -> Manifest {
        let xml = format!(
            r#"<BurnManifest>
                 <Registration Id="{}" Name="Test Bundle" Version="1.0.0.0"/>
                 {}
                 <Chain>{}</Chain>
               </BurnManifest>"#,
            BUNDLE_ID, extra, chain
        );
        let manifest = Manifest::parse(&xml).unwrap();
        for package in &manifest.packages {
            std::fs::write(self.source.join(&package.file_name), b"payload").unwrap();
        }
        manifest
    }

    pub fn store(&self) -> FileRegistrationStore {
        FileRegistrationStore::new(self.config.registration_dir(BUNDLE_ID))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.config.cache_dir(BUNDLE_ID)
    }

    pub fn engine(
        &self,
        manifest: Manifest,
        ux: Arc<RecordingUx>,
        runner: Arc<RecordingRunner>,
        probe: Arc<FakeSystem>,
    ) -> Arc<Engine> {
        self.engine_with_ux(manifest, ux, runner, probe)
    }

    pub fn engine_with_ux(
        &self,
        manifest: Manifest,
        ux: Arc<dyn UserExperience>,
        runner: Arc<RecordingRunner>,
        probe: Arc<FakeSystem>,
    ) -> Arc<Engine> {
        Engine::builder(manifest, self.config.clone())
            .ux(ux)
            .runner(runner)
            .probe(probe)
            .registration(Box::new(self.store()))
            .source_dir(&self.source)
            .build()
            .unwrap()
    }
}
