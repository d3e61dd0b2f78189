//! Lifetime of installer and companion processes
//!
//! Every process the engine starts (an msiexec/wusa/setup run, or the elevated
//! companion) must not outlive the engine: nothing would record its outcome
//! or roll it back.
//!
//! - Children start in their own process group with a parent-death signal
//! - Every child PID is tracked in a global registry, labelled for logs
//! - The first SIGINT/SIGTERM requests cancellation so the apply can roll
//!   back at the next package boundary; a second one terminates the children
//!   (SIGTERM, then SIGKILL after a grace period) and exits

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Registry tracking all spawned child processes
#[derive(Debug, Default)]
pub struct ChildRegistry {
    /// PID -> what the process is (package id or "companion")
    children: HashMap<u32, String>,
    /// Set once termination has started
    cleanup_initiated: bool,
}

impl ChildRegistry {
    /// Get or create the global child registry
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32, label: impl Into<String>) {
        let label = label.into();
        tracing::debug!("Registered child process PID {} ({})", pid, label);
        self.children.insert(pid, label);
    }

    pub fn unregister(&mut self, pid: u32) {
        if let Some(label) = self.children.remove(&pid) {
            tracing::debug!("Unregistered child process PID {} ({})", pid, label);
        }
    }

    pub fn count(&self) -> usize {
        self.children.len()
    }

    /// Terminate all tracked children: SIGTERM to each process group, wait up
    /// to `grace_period`, then SIGKILL whatever is left.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            tracing::debug!("Child cleanup already initiated, skipping");
            return;
        }
        self.cleanup_initiated = true;

        if self.children.is_empty() {
            return;
        }

        tracing::info!("Terminating {} child process(es)", self.children.len());

        let pids: Vec<u32> = self.children.keys().copied().collect();
        for &pid in &pids {
            if let Err(e) = send_signal_to_group(pid, Signal::SIGTERM) {
                tracing::warn!("SIGTERM to process group {} failed: {}", pid, e);
                if let Err(e) = send_signal(pid, Signal::SIGTERM) {
                    tracing::warn!("SIGTERM to PID {} failed: {}", pid, e);
                }
            }
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if pids.iter().all(|&pid| !is_process_alive(pid)) {
                tracing::info!("All child processes terminated");
                self.children.clear();
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in &pids {
            if is_process_alive(pid) {
                let label = self.children.get(&pid).map(String::as_str).unwrap_or("?");
                tracing::warn!("Process group {} ({}) ignored SIGTERM, sending SIGKILL", pid, label);
                if send_signal_to_group(pid, Signal::SIGKILL).is_err() {
                    let _ = send_signal(pid, Signal::SIGKILL);
                }
            }
        }

        self.children.clear();
    }
}

/// Run `f` with the global registry locked. A poisoned lock is recovered;
/// the registry holds no invariant a panicking holder could break.
pub fn with_registry<R>(f: impl FnOnce(&mut ChildRegistry) -> R) -> R {
    let registry = ChildRegistry::global();
    let mut guard = match registry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut guard)
}

fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Negative PID signals the whole group, including grandchildren an
/// installer spawned.
fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Whether `pid` exists and is not a zombie.
pub fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // Field 3 of /proc/<pid>/stat is the state letter
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        let fields: Vec<&str> = stat.split_whitespace().collect();
        if fields.len() > 2 {
            return !matches!(fields[2], "Z" | "X");
        }
    }

    true
}

/// Terminates every tracked child when dropped.
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self {
            registry: ChildRegistry::global(),
        }
    }

    pub fn child_count(&self) -> usize {
        self.registry.lock().map(|r| r.count()).unwrap_or(0)
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.terminate_all(Duration::from_secs(5));
        }
    }
}

/// Install SIGINT/SIGTERM/SIGHUP handling.
///
/// The first signal sets `cancel`; the engine observes it at the next package
/// boundary and rolls back. A second signal terminates all children and exits
/// with 128 + signal number.
pub fn init_signal_handlers(cancel: Arc<AtomicBool>) -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::Builder::new()
        .name("burn-signals".into())
        .spawn(move || {
            for sig in signals.forever() {
                let name = match sig {
                    SIGINT => "SIGINT",
                    SIGTERM => "SIGTERM",
                    SIGHUP => "SIGHUP",
                    _ => "signal",
                };

                if !cancel.swap(true, Ordering::SeqCst) {
                    tracing::warn!("Received {}, cancelling at the next package boundary", name);
                    continue;
                }

                tracing::warn!("Received {} again, terminating installers", name);
                with_registry(|registry| registry.terminate_all(Duration::from_secs(3)));
                std::process::exit(128 + sig);
            }
        })?;

    Ok(())
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Make the child a process group leader that receives SIGTERM when the
    /// engine dies.
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the closure only calls async-signal-safe functions
        // (setpgid, prctl) between fork and exec.
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn wait_for_process_death(pid: u32, timeout: Duration) -> bool {
        use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};

        let start = Instant::now();
        let nix_pid = Pid::from_raw(pid as i32);

        while start.elapsed() < timeout {
            match waitpid(nix_pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(_, _, _)) => return true,
                Err(nix::errno::Errno::ECHILD) if !is_process_alive(pid) => return true,
                _ => {}
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_registry_labels() {
        let mut registry = ChildRegistry::default();
        registry.register(1234, "NetFx");
        registry.register(5678, "companion");
        assert_eq!(registry.count(), 2);

        registry.unregister(1234);
        registry.unregister(4321);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_terminate_all_kills_process_group() {
        let child = Command::new("sh")
            .args(["-c", "sleep 60"])
            .in_new_process_group()
            .spawn()
            .expect("spawn sh");
        let pid = child.id();

        let mut registry = ChildRegistry::default();
        registry.register(pid, "Sleeper");
        assert!(is_process_alive(pid));

        registry.terminate_all(Duration::from_millis(500));
        assert!(wait_for_process_death(pid, Duration::from_secs(2)));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_terminate_all_runs_once() {
        let mut registry = ChildRegistry::default();
        registry.register(999_999, "Gone");

        registry.terminate_all(Duration::from_millis(10));
        assert!(registry.cleanup_initiated);

        registry.register(999_998, "Late");
        registry.terminate_all(Duration::from_millis(10));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_is_process_alive_nonexistent() {
        assert!(!is_process_alive(999_999));
        assert!(send_signal(999_999, Signal::SIGTERM).is_err());
    }
}
