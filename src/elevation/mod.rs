//! Per-machine execution through an elevated companion
//!
//! When the plan touches per-machine packages and this process is not
//! privileged, the engine starts a second copy of itself through the
//! configured launcher (sudo by default) in `elevated` mode. The two talk
//! over the companion's stdin/stdout using the frames in [`pipe`].
//!
//! The companion proves it was started by us by echoing a one-time secret
//! handed over in the environment. It never holds bundle variables of its
//! own: every `[Name]` it needs while building a command line is asked of
//! this process.

pub mod companion;
pub mod pipe;

use crate::error::{BurnError, HResult, Result};
use crate::package::invocation::ExecuteOutcome;
use crate::process_guard::{CommandProcessGroup, with_registry};
use crate::runner::ProgressFn;
use crate::types::ActionState;
use crate::variables::Variant;
use pipe::{PROTOCOL_VERSION, Pipe, PipeMessage};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Environment variable carrying the connection secret to the companion.
pub const SECRET_ENV: &str = "BURN_PIPE_SECRET";

/// Resolves a variable for the companion: value and hidden flag.
pub type VariableLookup<'a> = dyn Fn(&str) -> Option<(Variant, bool)> + 'a;

/// What the companion needs to find the bundle it works for.
#[derive(Debug, Clone)]
pub struct ElevationRequest {
    pub manifest_path: PathBuf,
    pub cache_dir: PathBuf,
    pub config_path: Option<PathBuf>,
}

/// A connected elevated companion.
pub trait ElevatedSession: Send {
    /// Run one package action in the companion.
    fn execute_package(
        &mut self,
        package_id: &str,
        action: ActionState,
        rollback: bool,
        variables: &VariableLookup<'_>,
        progress: &mut ProgressFn<'_>,
    ) -> Result<ExecuteOutcome>;

    /// End the session; `abort` when the apply failed or was cancelled.
    fn terminate(self: Box<Self>, abort: bool) -> Result<HResult>;
}

/// Starts elevated sessions.
pub trait Elevator: Send + Sync {
    fn elevate(&self, request: &ElevationRequest) -> Result<Box<dyn ElevatedSession>>;
}

/// Generate a fresh connection secret.
pub fn new_secret() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Parent side of the pipe.
pub struct PipeSession {
    pipe: Pipe,
    child: Option<Child>,
    exit_timeout: Duration,
}

impl PipeSession {
    /// Wait for the companion's Connect and check its secret and protocol.
    pub fn connect(pipe: Pipe, expected_secret: &str, child: Option<Child>) -> Result<Self> {
        let mut session = Self {
            pipe,
            child,
            exit_timeout: Duration::from_secs(10),
        };

        match session.pipe.recv() {
            Ok(PipeMessage::Connect {
                secret,
                protocol_version,
            }) if secret == expected_secret && protocol_version == PROTOCOL_VERSION => {
                tracing::info!("Elevated companion connected");
                Ok(session)
            }
            Ok(PipeMessage::Connect {
                protocol_version, ..
            }) if protocol_version != PROTOCOL_VERSION => {
                session.kill();
                Err(BurnError::elevation(format!(
                    "companion speaks protocol {}, expected {}",
                    protocol_version, PROTOCOL_VERSION
                )))
            }
            Ok(PipeMessage::Connect { .. }) => {
                session.kill();
                Err(BurnError::elevation("companion presented the wrong secret"))
            }
            Ok(PipeMessage::Terminate { .. }) => {
                session.kill();
                Err(BurnError::elevation(
                    "companion exited before connecting (elevation refused?)",
                ))
            }
            Ok(other) => {
                session.kill();
                Err(BurnError::elevation(format!(
                    "companion sent {} before connecting",
                    other.name()
                )))
            }
            Err(e) => {
                session.kill();
                Err(BurnError::elevation(format!("companion did not connect: {}", e)))
            }
        }
    }

    fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            let pid = child.id();
            let _ = child.kill();
            let _ = child.wait();
            with_registry(|registry| registry.unregister(pid));
        }
    }

    /// Reap the companion, killing it if it does not exit in time.
    fn reap(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let pid = child.id();
        let deadline = Instant::now() + self.exit_timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!("Elevated companion exited with {}", status);
                    break;
                }
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                _ => {
                    tracing::warn!("Elevated companion (PID {}) did not exit; killing it", pid);
                    let _ = child.kill();
                    let _ = child.wait();
                    break;
                }
            }
        }
        with_registry(|registry| registry.unregister(pid));
    }
}

impl ElevatedSession for PipeSession {
    fn execute_package(
        &mut self,
        package_id: &str,
        action: ActionState,
        rollback: bool,
        variables: &VariableLookup<'_>,
        progress: &mut ProgressFn<'_>,
    ) -> Result<ExecuteOutcome> {
        self.pipe.send(&PipeMessage::ExecutePackage {
            package_id: package_id.to_string(),
            action,
            rollback,
        })?;

        loop {
            match self.pipe.recv()? {
                PipeMessage::Progress { percent } => {
                    let cancel = progress(percent).is_cancel();
                    self.pipe.send(&PipeMessage::ProgressReply { cancel })?;
                }
                request @ (PipeMessage::GetPriorVariableNumeric { .. }
                | PipeMessage::GetPriorVariableString { .. }
                | PipeMessage::GetPriorVariableVersion { .. }) => {
                    self.pipe.send(&answer_variable_request(&request, variables))?;
                }
                PipeMessage::Complete { hresult, restart } => {
                    return Ok(ExecuteOutcome { hresult, restart });
                }
                PipeMessage::Terminate { .. } => {
                    return Err(BurnError::communication(format!(
                        "companion went away while executing {}",
                        package_id
                    )));
                }
                other => {
                    return Err(BurnError::communication(format!(
                        "unexpected {} while executing {}",
                        other.name(),
                        package_id
                    )));
                }
            }
        }
    }

    fn terminate(mut self: Box<Self>, abort: bool) -> Result<HResult> {
        let result = self
            .pipe
            .request(&PipeMessage::Terminate { abort })
            .and_then(|reply| match reply {
                PipeMessage::Complete { hresult, .. } => Ok(hresult),
                // Already gone: nothing left to terminate
                PipeMessage::Terminate { .. } => Ok(HResult::S_OK),
                other => Err(BurnError::communication(format!(
                    "unexpected {} in reply to Terminate",
                    other.name()
                ))),
            });
        self.reap();
        result
    }
}

/// Reply to a GetPriorVariable* request with the value converted to the
/// requested type. A value that does not convert reads as unset.
fn answer_variable_request(request: &PipeMessage, variables: &VariableLookup<'_>) -> PipeMessage {
    let unset = PipeMessage::VariableResult {
        value: None,
        hidden: false,
    };
    let name = match request {
        PipeMessage::GetPriorVariableNumeric { name }
        | PipeMessage::GetPriorVariableString { name }
        | PipeMessage::GetPriorVariableVersion { name } => name.as_str(),
        _ => return unset,
    };
    let Some((value, hidden)) = variables(name) else {
        return unset;
    };

    let converted = match request {
        PipeMessage::GetPriorVariableNumeric { .. } => value.as_numeric().map(Variant::Numeric),
        PipeMessage::GetPriorVariableVersion { .. } => value.as_version().map(Variant::Version),
        _ => Ok(Variant::String(value.to_string())),
    };
    match converted {
        Ok(value) => PipeMessage::VariableResult {
            value: Some(value),
            hidden,
        },
        Err(e) => {
            tracing::error!("Companion asked for {} with {}: {}", name, request.name(), e);
            PipeMessage::VariableResult {
                value: None,
                hidden,
            }
        }
    }
}

impl Drop for PipeSession {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Starts the companion as `<launcher...> <this exe> elevated ...`.
#[derive(Debug, Clone)]
pub struct ProcessElevator {
    launcher: Vec<String>,
    timeout: Duration,
}

impl ProcessElevator {
    pub fn new(launcher: Vec<String>, timeout: Duration) -> Self {
        Self { launcher, timeout }
    }

    fn command(&self, request: &ElevationRequest) -> Result<Command> {
        let exe = std::env::current_exe()?;
        let mut cmd = match self.launcher.split_first() {
            Some((program, args)) => {
                let mut cmd = Command::new(program);
                cmd.args(args).arg(exe);
                cmd
            }
            None => Command::new(exe),
        };
        cmd.arg("elevated")
            .arg("--manifest")
            .arg(&request.manifest_path)
            .arg("--cache-dir")
            .arg(&request.cache_dir);
        if let Some(config) = &request.config_path {
            cmd.arg("--config").arg(config);
        }
        Ok(cmd)
    }
}

impl Elevator for ProcessElevator {
    fn elevate(&self, request: &ElevationRequest) -> Result<Box<dyn ElevatedSession>> {
        let secret = new_secret();
        let mut cmd = self.command(request)?;
        cmd.env(SECRET_ENV, &secret)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .in_new_process_group();

        tracing::info!("Launching elevated companion: {:?}", cmd);
        let mut child = cmd
            .spawn()
            .map_err(|e| BurnError::elevation(format!("failed to launch companion: {}", e)))?;
        with_registry(|registry| registry.register(child.id(), "companion"));

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            with_registry(|registry| registry.unregister(child.id()));
            return Err(BurnError::elevation("companion has no stdio pipes"));
        };

        let pipe = Pipe::new(stdout, stdin, self.timeout)?;
        let session = PipeSession::connect(pipe, &secret, Some(child))?;
        Ok(Box::new(session))
    }
}
