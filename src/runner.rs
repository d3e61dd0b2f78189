//! Installer execution
//!
//! `PackageRunner` is the only way the engine starts an installer. The process
//! runner isolates the child in its own process group, registers it for
//! cleanup, streams its output into the log and polls it so the UX keeps
//! getting progress callbacks (and a chance to cancel) while it runs.
//!
//! Installer stdout is never inherited: in companion mode stdout is the
//! elevation pipe.

use crate::error::{BurnError, HResult, Result};
use crate::package::invocation::{ExecuteOutcome, InstallerArgs};
use crate::process_guard::{CommandProcessGroup, with_registry};
use crate::types::UxCommand;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Progress sink: receives a percentage, answers Cancel to stop the installer.
pub type ProgressFn<'a> = dyn FnMut(u8) -> UxCommand + 'a;

/// Runs one installer invocation to completion.
pub trait PackageRunner: Send + Sync {
    fn run(&self, args: &dyn InstallerArgs, progress: &mut ProgressFn<'_>) -> Result<ExecuteOutcome>;
}

/// Runs installers as child processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    /// Interval between progress callbacks while the installer runs
    pub tick: Duration,
    /// How long a cancelled installer gets between SIGTERM and SIGKILL
    pub cancel_grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(250),
            cancel_grace: Duration::from_secs(10),
        }
    }
}

impl PackageRunner for ProcessRunner {
    fn run(&self, args: &dyn InstallerArgs, progress: &mut ProgressFn<'_>) -> Result<ExecuteOutcome> {
        let package_id = args.package_id();
        let program = args.program();

        tracing::info!(
            "Executing package {}: {} {:?}",
            package_id,
            program.display(),
            args.display_args()
        );

        let mut cmd = Command::new(program);
        cmd.args(args.to_cli_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();
        for (key, value) in args.get_env_vars() {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            let reason = format!("failed to launch {}: {}", program.display(), e);
            BurnError::configuration(package_id, BurnError::Io(e).hresult(), reason)
        })?;
        let pid = child.id();
        with_registry(|registry| registry.register(pid, package_id));

        let drains = [
            child.stdout.take().map(|out| drain(out, package_id, "stdout")),
            child.stderr.take().map(|err| drain(err, package_id, "stderr")),
        ];

        let mut cancelled = progress(0).is_cancel();
        let status = loop {
            if cancelled {
                break None;
            }
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {}
                Err(e) => {
                    with_registry(|registry| registry.unregister(pid));
                    return Err(BurnError::configuration(
                        package_id,
                        HResult::E_FAIL,
                        format!("failed waiting for installer: {}", e),
                    ));
                }
            }
            std::thread::sleep(self.tick);
            // Heartbeat; the installer itself reports nothing finer.
            cancelled = progress(0).is_cancel();
        };

        let outcome = match status {
            None => {
                tracing::warn!("Cancelling package {} (PID {})", package_id, pid);
                self.stop(pid);
                let _ = child.wait();
                ExecuteOutcome::failure(HResult::E_INSTALL_USEREXIT)
            }
            Some(status) => match status.code() {
                Some(code) => args.interpret_exit_code(code),
                None => {
                    tracing::error!("Package {} installer was killed by a signal", package_id);
                    ExecuteOutcome::failure(HResult::E_FAIL)
                }
            },
        };
        with_registry(|registry| registry.unregister(pid));

        for handle in drains.into_iter().flatten() {
            let _ = handle.join();
        }

        if outcome.is_success() {
            progress(100);
            tracing::info!(
                "Package {} completed (restart: {:?})",
                package_id,
                outcome.restart
            );
        } else {
            tracing::error!("Package {} failed with {}", package_id, outcome.hresult);
        }
        Ok(outcome)
    }
}

impl ProcessRunner {
    /// SIGTERM the installer's process group, SIGKILL after the grace period.
    fn stop(&self, pid: u32) {
        let group = Pid::from_raw(-(pid as i32));
        let _ = signal::kill(group, Signal::SIGTERM);
        let start = Instant::now();
        while start.elapsed() < self.cancel_grace {
            if !crate::process_guard::is_process_alive(pid) {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        let _ = signal::kill(group, Signal::SIGKILL);
    }
}

fn drain<R: Read + Send + 'static>(stream: R, package_id: &str, name: &'static str) -> JoinHandle<()> {
    let package_id = package_id.to_string();
    std::thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            match line {
                Ok(line) if !line.trim().is_empty() => {
                    tracing::debug!(target: "burn::installer", "[{}:{}] {}", package_id, name, line);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    })
}
