//! The elevated side of the pipe
//!
//! Connects, then serves ExecutePackage requests until told to terminate.
//! Packages are looked up in the companion's own copy of the manifest and
//! run from the bundle cache; variables come from the parent.

use super::pipe::{PROTOCOL_VERSION, Pipe, PipeMessage};
use crate::config::EngineConfig;
use crate::error::{BurnError, HResult, Result};
use crate::manifest::Manifest;
use crate::package::invocation::{ExecuteOutcome, Restart};
use crate::package::{InvocationContext, configure_package};
use crate::runner::PackageRunner;
use crate::types::{ActionState, UxCommand};
use crate::variables::{Lookup, VariableSource};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub struct CompanionOptions {
    pub secret: String,
    pub manifest: Manifest,
    pub config: EngineConfig,
    pub cache_dir: PathBuf,
    pub runner: Arc<dyn PackageRunner>,
    pub timeout: Duration,
}

/// Resolves `[Name]` by asking the parent.
struct PipeVariableSource<'a> {
    pipe: &'a mut Pipe,
}

impl VariableSource for PipeVariableSource<'_> {
    fn lookup(&mut self, name: &str) -> Result<Option<Lookup>> {
        let reply = self.pipe.request(&PipeMessage::GetPriorVariableString {
            name: name.to_string(),
        })?;
        match reply {
            PipeMessage::VariableResult { value, hidden } => Ok(value.map(|value| Lookup {
                value: value.to_string(),
                hidden,
            })),
            other => Err(BurnError::communication(format!(
                "expected VariableResult for '{}', got {}",
                name,
                other.name()
            ))),
        }
    }
}

/// Serve the parent until it terminates the session or goes away.
///
/// Returns the status of the last package run.
pub fn run_companion<R, W>(reader: R, writer: W, options: CompanionOptions) -> Result<HResult>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let mut pipe = Pipe::new(reader, writer, options.timeout)?;
    pipe.send(&PipeMessage::Connect {
        secret: options.secret.clone(),
        protocol_version: PROTOCOL_VERSION,
    })?;

    let mut last = HResult::S_OK;
    loop {
        match pipe.recv_idle()? {
            PipeMessage::ExecutePackage {
                package_id,
                action,
                rollback,
            } => {
                let outcome = execute(&mut pipe, &options, &package_id, action, rollback);
                last = outcome.hresult;
                pipe.send(&PipeMessage::Complete {
                    hresult: outcome.hresult,
                    restart: outcome.restart,
                })?;
            }
            PipeMessage::Terminate { abort } => {
                tracing::info!("Companion terminating (abort: {})", abort);
                // The parent may already be gone
                let _ = pipe.send(&PipeMessage::Complete {
                    hresult: last,
                    restart: Restart::None,
                });
                return Ok(last);
            }
            other => {
                return Err(BurnError::communication(format!(
                    "companion received unexpected {}",
                    other.name()
                )));
            }
        }
    }
}

fn execute(
    pipe: &mut Pipe,
    options: &CompanionOptions,
    package_id: &str,
    action: ActionState,
    rollback: bool,
) -> ExecuteOutcome {
    let Some(package) = options.manifest.package(package_id) else {
        tracing::error!("Parent asked for unknown package '{}'", package_id);
        return ExecuteOutcome::failure(HResult::E_NOTFOUND);
    };
    tracing::info!(
        "Elevated {} of {}{}",
        action,
        package_id,
        if rollback { " (rollback)" } else { "" }
    );

    let args = {
        let mut source = PipeVariableSource { pipe: &mut *pipe };
        let mut ctx = InvocationContext {
            config: &options.config,
            cache_dir: &options.cache_dir,
            variables: &mut source,
        };
        match configure_package(package, action, &mut ctx) {
            Ok(args) => args,
            Err(e) => {
                tracing::error!("{}", e);
                return ExecuteOutcome::failure(e.hresult());
            }
        }
    };

    let mut progress = |percent: u8| -> UxCommand {
        let reply = pipe.request(&PipeMessage::Progress { percent });
        match reply {
            Ok(PipeMessage::ProgressReply { cancel: false }) => UxCommand::Ok,
            Ok(PipeMessage::ProgressReply { cancel: true }) => UxCommand::Cancel,
            Ok(other) => {
                tracing::error!("Expected ProgressReply, got {}", other.name());
                UxCommand::Cancel
            }
            Err(e) => {
                tracing::error!("Lost the parent while reporting progress: {}", e);
                UxCommand::Cancel
            }
        }
    };

    match options.runner.run(args.as_ref(), &mut progress) {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!("{}", e);
            ExecuteOutcome::failure(e.hresult())
        }
    }
}
