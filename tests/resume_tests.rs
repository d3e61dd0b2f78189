// Suspend, restart and resume across engine instances sharing one registration.

mod common;

use burn_engine::ConsoleUx;
use burn_engine::engine::{Engine, EngineHost, EnginePhase};
use burn_engine::error::{BurnError, HResult, Result};
use burn_engine::manifest::Registration;
use burn_engine::package::invocation::{ExecuteOutcome, Restart};
use burn_engine::registration::{FileRegistrationStore, RegistrationRecord, RegistrationStore, SessionEnd};
use burn_engine::state::EngineSnapshot;
use burn_engine::types::{BundleAction, PackageState, ResumeMode, ResumeType};
use common::*;
use std::sync::Arc;

fn three_packages(fixture: &Fixture) -> burn_engine::Manifest {
    fixture.manifest(&format!(
        "{}{}{}",
        msi("A", 1, ""),
        msi("B", 2, ""),
        msi("C", 3, "")
    ))
}

#[test]
fn test_suspend_then_resume_skips_completed_packages() {
    let fixture = Fixture::new();
    let manifest = three_packages(&fixture);

    let ux = RecordingUx::new(
        BundleAction::Install,
        UxScript {
            suspend_after: Some("A".into()),
            ..Default::default()
        },
    );
    let runner = RecordingRunner::new();
    let engine = fixture.engine(manifest.clone(), ux, runner.clone(), Arc::new(FakeSystem::new()));
    let summary = EngineHost::run(engine);

    assert_eq!(summary.status, HResult::S_OK);
    assert_eq!(summary.phase, EnginePhase::Applied);
    assert_eq!(runner.trace(), vec!["A:install"]);
    let record = fixture.store().record().unwrap().unwrap();
    assert_eq!(record.resume_mode, ResumeMode::Suspend);
    assert!(!record.installed);

    // Second run: A is not re-detected from the machine, its completed action counts
    let ux = RecordingUx::new(BundleAction::Install, UxScript::default());
    let runner = RecordingRunner::new();
    let engine = fixture.engine(manifest, ux.clone(), runner.clone(), Arc::new(FakeSystem::new()));
    assert_eq!(engine.resume_type().unwrap(), ResumeType::Suspend);
    let summary = EngineHost::run(engine);

    assert_eq!(summary.status, HResult::S_OK);
    assert!(ux.events().contains(&Event::DetectBegin(ResumeType::Suspend)));
    assert!(
        ux.events()
            .contains(&Event::DetectPackage("A".into(), PackageState::Present))
    );
    assert_eq!(runner.trace(), vec!["B:install", "C:install"]);

    let record = fixture.store().record().unwrap().unwrap();
    assert_eq!(record.resume_mode, ResumeMode::Arp);
    assert!(record.installed);
}

#[test]
fn test_second_suspend_keeps_earlier_completions() {
    let fixture = Fixture::new();
    let manifest = three_packages(&fixture);

    for (suspend_after, expected) in [("A", vec!["A:install"]), ("B", vec!["B:install"])] {
        let ux = RecordingUx::new(
            BundleAction::Install,
            UxScript {
                suspend_after: Some(suspend_after.into()),
                ..Default::default()
            },
        );
        let runner = RecordingRunner::new();
        let engine = fixture.engine(manifest.clone(), ux, runner.clone(), Arc::new(FakeSystem::new()));
        assert_eq!(EngineHost::run(engine).status, HResult::S_OK);
        assert_eq!(runner.trace(), expected);
    }

    let saved = fixture.store().load_state().unwrap().unwrap();
    assert!(saved.package("A").unwrap().completed);
    assert!(saved.package("B").unwrap().completed);

    // Neither A (first session) nor B (second session) is detected again
    let ux = RecordingUx::new(BundleAction::Install, UxScript::default());
    let runner = RecordingRunner::new();
    let engine = fixture.engine(manifest, ux.clone(), runner.clone(), Arc::new(FakeSystem::new()));
    assert_eq!(EngineHost::run(engine).status, HResult::S_OK);
    assert_eq!(runner.trace(), vec!["C:install"]);
    for id in ["A", "B"] {
        assert!(
            ux.events()
                .contains(&Event::DetectPackage(id.into(), PackageState::Present))
        );
    }
}

#[test]
fn test_console_ux_resumes_the_interrupted_action() {
    let fixture = Fixture::new();
    let manifest = three_packages(&fixture);

    let ux = RecordingUx::new(
        BundleAction::Install,
        UxScript {
            suspend_after: Some("A".into()),
            ..Default::default()
        },
    );
    let engine = fixture.engine(manifest.clone(), ux, RecordingRunner::new(), Arc::new(FakeSystem::new()));
    assert_eq!(EngineHost::run(engine).status, HResult::S_OK);

    // Relaunched with a different action: the suspended install is finished
    let runner = RecordingRunner::new();
    let ux = Arc::new(ConsoleUx::new(BundleAction::Repair, false));
    let engine = fixture.engine_with_ux(manifest, ux, runner.clone(), Arc::new(FakeSystem::new()));
    assert_eq!(EngineHost::run(engine).status, HResult::S_OK);
    assert_eq!(runner.trace(), vec!["B:install", "C:install"]);
}

/// Delegates to the file store but cannot end a session, as when the disk
/// fills up or the process dies right before it.
struct FailingEndStore(FileRegistrationStore);

impl RegistrationStore for FailingEndStore {
    fn session_begin(&mut self, registration: &Registration, snapshot: &EngineSnapshot) -> Result<()> {
        self.0.session_begin(registration, snapshot)
    }

    fn session_suspend(&mut self, snapshot: &EngineSnapshot, reboot_boot_id: Option<&str>) -> Result<()> {
        self.0.session_suspend(snapshot, reboot_boot_id)
    }

    fn session_end(&mut self, _end: SessionEnd) -> Result<()> {
        Err(BurnError::registration("session end failed"))
    }

    fn detect_resume_type(&self, current_boot_id: Option<&str>) -> ResumeType {
        self.0.detect_resume_type(current_boot_id)
    }

    fn save_state(&mut self, snapshot: &EngineSnapshot) -> Result<()> {
        self.0.save_state(snapshot)
    }

    fn load_state(&self) -> Result<Option<EngineSnapshot>> {
        self.0.load_state()
    }

    fn record(&self) -> Result<Option<RegistrationRecord>> {
        self.0.record()
    }
}

#[test]
fn test_rolled_back_package_is_detected_again_after_crash() {
    let fixture = Fixture::new();
    let manifest = fixture.manifest(&format!("{}{}", msi("A", 1, ""), msi("B", 2, "")));

    let runner = RecordingRunner::new();
    runner.fail("B");
    let engine = Engine::builder(manifest.clone(), fixture.config.clone())
        .ux(RecordingUx::new(BundleAction::Install, UxScript::default()))
        .runner(runner.clone())
        .probe(Arc::new(FakeSystem::new()))
        .registration(Box::new(FailingEndStore(fixture.store())))
        .source_dir(&fixture.source)
        .build()
        .unwrap();
    assert!(EngineHost::run(engine).status.is_failure());
    assert_eq!(runner.trace(), vec!["A:install", "B:install", "A:uninstall"]);

    // The session never ended, but the saved state knows A was undone
    assert!(!fixture.store().load_state().unwrap().unwrap().package("A").unwrap().completed);

    let ux = RecordingUx::new(BundleAction::Install, UxScript::default());
    let runner = RecordingRunner::new();
    let engine = fixture.engine(manifest, ux.clone(), runner.clone(), Arc::new(FakeSystem::new()));
    assert_eq!(engine.resume_type().unwrap(), ResumeType::Unexpected);
    assert_eq!(EngineHost::run(engine).status, HResult::S_OK);

    assert!(
        ux.events()
            .contains(&Event::DetectPackage("A".into(), PackageState::Absent))
    );
    assert_eq!(runner.trace(), vec!["A:install", "B:install"]);
}

#[test]
fn test_reboot_request_marks_reboot_pending() {
    let fixture = Fixture::new();
    let manifest = three_packages(&fixture);
    let probe = Arc::new(FakeSystem::new());

    let ux = RecordingUx::new(
        BundleAction::Install,
        UxScript {
            reboot_after: Some("B".into()),
            ..Default::default()
        },
    );
    let runner = RecordingRunner::new();
    let engine = fixture.engine(manifest.clone(), ux, runner.clone(), probe.clone());
    let summary = EngineHost::run(engine);

    assert_eq!(summary.status, HResult::S_OK);
    assert!(summary.restart_requested);
    assert_eq!(runner.trace(), vec!["A:install", "B:install"]);
    assert_eq!(
        fixture.store().record().unwrap().unwrap().resume_mode,
        ResumeMode::RebootPending
    );

    // Same boot session: the restart has not happened yet
    let ux = RecordingUx::new(BundleAction::Install, UxScript::default());
    let engine = fixture.engine(manifest.clone(), ux, RecordingRunner::new(), probe.clone());
    assert_eq!(engine.resume_type().unwrap(), ResumeType::RebootPending);
    drop(engine);

    // After the restart
    probe.set_boot_id("boot-2");
    let ux = RecordingUx::new(BundleAction::Install, UxScript::default());
    let runner = RecordingRunner::new();
    let engine = fixture.engine(manifest, ux, runner.clone(), probe);
    assert_eq!(engine.resume_type().unwrap(), ResumeType::Reboot);
    assert_eq!(EngineHost::run(engine).status, HResult::S_OK);
    assert_eq!(runner.trace(), vec!["C:install"]);
}

#[test]
fn test_restart_required_resumes_after_reboot() {
    let fixture = Fixture::new();
    let manifest = fixture.manifest(&format!("{}{}", msi("A", 1, ""), msi("B", 2, "")));
    let probe = Arc::new(FakeSystem::new());

    let ux = RecordingUx::new(BundleAction::Install, UxScript::default());
    let runner = RecordingRunner::new();
    runner.script(
        "A",
        &[ExecuteOutcome {
            hresult: HResult::S_OK,
            restart: Restart::Required,
        }],
    );
    let engine = fixture.engine(manifest.clone(), ux, runner.clone(), probe.clone());
    let summary = EngineHost::run(engine);

    // The chain still runs to the end; the restart is reported, not forced
    assert_eq!(runner.trace(), vec!["A:install", "B:install"]);
    assert_eq!(summary.exit_code(), 3010);
    let record = fixture.store().record().unwrap().unwrap();
    assert_eq!(record.resume_mode, ResumeMode::RebootPending);
    assert_eq!(record.reboot_boot_id.as_deref(), Some("boot-1"));

    probe.set_boot_id("boot-2");
    let ux = RecordingUx::new(BundleAction::Install, UxScript::default());
    let runner = RecordingRunner::new();
    let engine = fixture.engine(manifest, ux.clone(), runner.clone(), probe);
    let summary = EngineHost::run(engine);

    assert_eq!(summary.status, HResult::S_OK);
    assert!(ux.events().contains(&Event::DetectBegin(ResumeType::Reboot)));
    assert!(runner.trace().is_empty());
    assert_eq!(
        fixture.store().record().unwrap().unwrap().resume_mode,
        ResumeMode::Arp
    );
}

#[test]
fn test_interrupted_session_resumes_as_unexpected() {
    let fixture = Fixture::new();
    let manifest = three_packages(&fixture);

    let ux = RecordingUx::new(BundleAction::Install, UxScript::default());
    let engine = fixture.engine(manifest.clone(), ux, RecordingRunner::new(), Arc::new(FakeSystem::new()));
    let snapshot = engine.snapshot().unwrap();
    drop(engine);

    // A session that began and never ended, as after a crash
    let mut store = fixture.store();
    store.session_begin(&manifest.registration, &snapshot).unwrap();

    let ux = RecordingUx::new(BundleAction::Install, UxScript::default());
    let engine = fixture.engine(manifest, ux, RecordingRunner::new(), Arc::new(FakeSystem::new()));
    assert_eq!(engine.resume_type().unwrap(), ResumeType::Unexpected);
}

#[test]
fn test_unreadable_state_blob_starts_fresh() {
    let fixture = Fixture::new();
    let manifest = three_packages(&fixture);

    let ux = RecordingUx::new(
        BundleAction::Install,
        UxScript {
            suspend_after: Some("A".into()),
            ..Default::default()
        },
    );
    let engine = fixture.engine(manifest.clone(), ux, RecordingRunner::new(), Arc::new(FakeSystem::new()));
    assert_eq!(EngineHost::run(engine).status, HResult::S_OK);

    let blob = fixture.config.registration_dir(BUNDLE_ID).join("state.bin");
    std::fs::write(&blob, b"not a state blob").unwrap();

    let ux = RecordingUx::new(BundleAction::Install, UxScript::default());
    let runner = RecordingRunner::new();
    let engine = fixture.engine(manifest, ux, runner.clone(), Arc::new(FakeSystem::new()));
    assert_eq!(engine.resume_type().unwrap(), ResumeType::Invalid);

    // Nothing is trusted from the broken session: every package is detected again
    assert_eq!(EngineHost::run(engine).status, HResult::S_OK);
    assert_eq!(runner.trace(), vec!["A:install", "B:install", "C:install"]);
}
