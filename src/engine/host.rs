//! The message pump
//!
//! One engine thread hosts the UX: it hands the UX its `CoreHandle`, then
//! runs posted requests in order until one of them is Quit.

use super::facade::{CoreHandle, EngineCommand};
use super::{Engine, EnginePhase};
use crate::error::HResult;
use crate::process_guard::CommandProcessGroup;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc;

/// How a bundle run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub status: HResult,
    pub phase: EnginePhase,
    pub restart_required: bool,
    /// The UX (or restart policy) asked for a restart at shutdown
    pub restart_requested: bool,
}

impl RunSummary {
    /// Process exit code: the failure's code, 3010 when a restart is still
    /// needed, 0 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.status.is_failure() {
            self.status.exit_code()
        } else if self.restart_required {
            HResult::ERROR_SUCCESS_REBOOT_REQUIRED as i32
        } else {
            0
        }
    }
}

pub struct EngineHost;

impl EngineHost {
    /// Run the engine thread until the UX quits.
    pub fn run(engine: Arc<Engine>) -> RunSummary {
        let (tx, rx) = mpsc::channel();
        let core = CoreHandle::new(Arc::clone(&engine), tx);

        let worker = Arc::clone(&engine);
        let handle = std::thread::Builder::new()
            .name("burn-engine".into())
            .spawn(move || pump(&worker, core, rx));

        let status = match handle {
            Ok(handle) => handle.join().unwrap_or_else(|_| {
                tracing::error!("Engine thread panicked");
                HResult::E_UNEXPECTED
            }),
            Err(e) => {
                tracing::error!("Failed to start the engine thread: {}", e);
                HResult::E_FAIL
            }
        };

        RunSummary {
            status,
            phase: engine.phase().unwrap_or(EnginePhase::Failed),
            restart_required: engine.restart_required().unwrap_or(false),
            restart_requested: engine.flags().restart.load(Ordering::SeqCst),
        }
    }
}

fn pump(engine: &Engine, core: CoreHandle, rx: mpsc::Receiver<EngineCommand>) -> HResult {
    tracing::debug!("Engine thread started");
    let ux = Arc::clone(engine.ux());
    ux.on_startup(core);

    let mut last = HResult::S_OK;
    let status = loop {
        let Ok(command) = rx.recv() else {
            tracing::warn!("Every core handle was dropped without Quit");
            break last;
        };
        tracing::debug!("Engine processing {:?}", command);

        let result = match command {
            EngineCommand::Detect => engine.detect(),
            EngineCommand::Plan(action) => engine.plan(action),
            EngineCommand::Apply => engine.apply(),
            EngineCommand::Quit(status) => break status,
        };
        match result {
            Ok(status) => last = status,
            Err(e) => {
                if let Some(op) = command.operation() {
                    engine.report_rejected(op, &e);
                }
            }
        }
    };

    ux.on_shutdown();
    tracing::info!("Engine finished with {}", status);
    status
}

/// Ask the operating system to restart the machine.
pub fn initiate_restart() -> std::io::Result<()> {
    tracing::warn!("Initiating system restart");
    let status = Command::new("shutdown")
        .args(["-r", "+1", "Restart requested by bundle installation"])
        .in_new_process_group()
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("shutdown exited with {}", status)))
    }
}
