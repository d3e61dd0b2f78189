//! Windows update packages, applied with `wusa`.
//!
//! Detection checks the installed-update list for the package's KB article
//! unless the manifest supplies its own detect condition.

use super::invocation::{ExecuteOutcome, InstallerArgs, Restart, standard_exit_code};
use super::{DetectContext, InvocationContext, Package};
use crate::error::{BurnError, HResult, Result};
use crate::types::{ActionState, PackageState};
use roxmltree::Node;
use std::path::{Path, PathBuf};

/// wusa: the update was installed, a restart is required.
pub const WU_S_REBOOT_REQUIRED: i32 = 0x0024_0005;
/// wusa: the update is already installed.
pub const WU_S_ALREADY_INSTALLED: i32 = 0x0024_0006;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsuPackage {
    /// Digits of the KB article, without the `KB` prefix
    pub kb: Option<String>,
    pub detect_condition: Option<String>,
}

pub(super) fn parse(node: Node<'_, '_>, id: &str) -> Result<MsuPackage> {
    let kb = node
        .attribute("KB")
        .map(|raw| {
            let trimmed = raw.trim();
            let digits = trimmed
                .strip_prefix("KB")
                .or_else(|| trimmed.strip_prefix("kb"))
                .unwrap_or(trimmed);
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                Err(BurnError::parse(format!(
                    "MsuPackage '{}' has invalid KB '{}'",
                    id, raw
                )))
            } else {
                Ok(digits.to_string())
            }
        })
        .transpose()?;

    let detect_condition = node.attribute("DetectCondition").map(str::to_string);
    if let Some(condition) = &detect_condition {
        crate::condition::validate(condition).map_err(|e| {
            BurnError::parse(format!("MsuPackage '{}' DetectCondition: {}", id, e))
        })?;
    }

    if kb.is_none() && detect_condition.is_none() {
        return Err(BurnError::parse(format!(
            "MsuPackage '{}' needs a KB or a DetectCondition",
            id
        )));
    }

    Ok(MsuPackage {
        kb,
        detect_condition,
    })
}

pub(super) fn detect(id: &str, msu: &MsuPackage, ctx: &DetectContext<'_>) -> Result<PackageState> {
    let present = match (&msu.detect_condition, &msu.kb) {
        (Some(condition), _) => crate::condition::evaluate(condition, ctx.variables)
            .map_err(|e| BurnError::detection(id, e.to_string()))?,
        (None, Some(kb)) => ctx
            .probe
            .qfe_installed(&format!("KB{}", kb))
            .map_err(|e| BurnError::detection(id, e.to_string()))?,
        (None, None) => return Err(BurnError::detection(id, "no detection method")),
    };
    tracing::debug!("MSU {}: present={}", id, present);
    Ok(if present {
        PackageState::Present
    } else {
        PackageState::Absent
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WusaOperation {
    Install { package_path: PathBuf },
    Uninstall { kb: String },
}

/// wusa invocation for one update.
#[derive(Debug, Clone)]
pub struct WusaArgs {
    pub package_id: String,
    pub wusa: PathBuf,
    pub operation: WusaOperation,
    pub log_path: Option<PathBuf>,
}

impl InstallerArgs for WusaArgs {
    fn package_id(&self) -> &str {
        &self.package_id
    }

    fn program(&self) -> &Path {
        &self.wusa
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = match &self.operation {
            WusaOperation::Install { package_path } => vec![package_path.display().to_string()],
            WusaOperation::Uninstall { kb } => {
                vec!["/uninstall".to_string(), format!("/kb:{}", kb)]
            }
        };
        args.push("/quiet".to_string());
        args.push("/norestart".to_string());
        if let Some(log) = &self.log_path {
            args.push(format!("/log:{}", log.display()));
        }
        args
    }

    fn interpret_exit_code(&self, code: i32) -> ExecuteOutcome {
        match code {
            WU_S_REBOOT_REQUIRED => ExecuteOutcome {
                hresult: HResult::S_OK,
                restart: Restart::Required,
            },
            WU_S_ALREADY_INSTALLED => ExecuteOutcome::success(),
            other => standard_exit_code(other),
        }
    }
}

pub(super) fn configure(
    package: &Package,
    msu: &MsuPackage,
    action: ActionState,
    ctx: &mut InvocationContext<'_>,
) -> Result<WusaArgs> {
    let operation = match (action, &msu.kb) {
        (ActionState::Install, _) => WusaOperation::Install {
            package_path: package.payload_path(ctx.cache_dir),
        },
        (ActionState::Uninstall, Some(kb)) => WusaOperation::Uninstall { kb: kb.clone() },
        _ => {
            return Err(BurnError::planning(format!(
                "package '{}' does not support {}",
                package.id, action
            )));
        }
    };

    let log_path = ctx
        .config
        .installer_log_dir
        .as_ref()
        .map(|dir| dir.join(format!("{}_{}.evtx", package.id, action)));

    Ok(WusaArgs {
        package_id: package.id.clone(),
        wusa: ctx.config.wusa.clone(),
        operation,
        log_path,
    })
}
