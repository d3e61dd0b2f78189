//! Windows Installer packages.
//!
//! Detection reads the product registration by product code; a newer product
//! under the same upgrade code makes the package obsolete. Actions run through
//! `msiexec` with restarts suppressed so the engine decides when to restart.

use super::invocation::InstallerArgs;
use super::{DetectContext, InvocationContext, Package, parse_guid, parse_version_attr, required_attr};
use crate::error::{BurnError, Result};
use crate::types::{ActionState, PackageState};
use crate::variables::format_pair;
use crate::version::Version;
use roxmltree::Node;
use std::path::{Path, PathBuf};

/// A public property passed on the msiexec command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsiProperty {
    pub id: String,
    /// Formatted with engine variables at execution time
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MsiPackage {
    pub product_code: String,
    pub product_version: Version,
    pub upgrade_code: Option<String>,
    pub properties: Vec<MsiProperty>,
}

pub(super) fn parse(node: Node<'_, '_>, id: &str) -> Result<MsiPackage> {
    let product_code = parse_guid(required_attr(node, "ProductCode")?, "ProductCode", id)?;
    let product_version = parse_version_attr(node, "ProductVersion", id)?;
    let upgrade_code = node
        .attribute("UpgradeCode")
        .map(|raw| parse_guid(raw, "UpgradeCode", id))
        .transpose()?;

    let mut properties = Vec::new();
    for child in node.children().filter(|n| n.has_tag_name("MsiProperty")) {
        let prop_id = required_attr(child, "Id")?;
        if !prop_id
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' || c == '.')
        {
            return Err(BurnError::parse(format!(
                "package '{}': MsiProperty '{}' must be a public (uppercase) property",
                id, prop_id
            )));
        }
        properties.push(MsiProperty {
            id: prop_id.to_string(),
            value: child.attribute("Value").unwrap_or_default().to_string(),
        });
    }

    Ok(MsiPackage {
        product_code,
        product_version,
        upgrade_code,
        properties,
    })
}

pub(super) fn detect(id: &str, msi: &MsiPackage, ctx: &DetectContext<'_>) -> Result<PackageState> {
    let installed = ctx
        .probe
        .msi_product_version(&msi.product_code)
        .map_err(|e| BurnError::detection(id, e.to_string()))?;

    let state = match installed {
        Some(v) if v == msi.product_version => PackageState::Present,
        Some(v) if v > msi.product_version => PackageState::Superseded,
        // An older build of the same product; installing upgrades it.
        Some(_) => PackageState::Absent,
        None => match &msi.upgrade_code {
            Some(upgrade_code) => {
                let related = ctx
                    .probe
                    .msi_related_products(upgrade_code)
                    .map_err(|e| BurnError::detection(id, e.to_string()))?;
                if related.iter().any(|p| p.version > msi.product_version) {
                    PackageState::Obsolete
                } else {
                    PackageState::Absent
                }
            }
            None => PackageState::Absent,
        },
    };

    tracing::debug!(
        "MSI {} ({} v{}): installed={:?} -> {}",
        id,
        msi.product_code,
        msi.product_version,
        installed.map(|v| v.to_string()),
        state
    );
    Ok(state)
}

/// What msiexec is asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsiOperation {
    Install { package_path: PathBuf },
    Repair { package_path: PathBuf },
    Uninstall { product_code: String },
}

/// msiexec invocation for one package action.
#[derive(Debug, Clone)]
pub struct MsiExecArgs {
    pub package_id: String,
    pub msiexec: PathBuf,
    pub operation: MsiOperation,
    /// (name, value, value as logged)
    pub properties: Vec<(String, String, String)>,
    pub log_path: Option<PathBuf>,
}

impl MsiExecArgs {
    fn build(&self, display: bool) -> Vec<String> {
        let mut args = match &self.operation {
            MsiOperation::Install { package_path } => {
                vec!["/i".to_string(), package_path.display().to_string()]
            }
            MsiOperation::Repair { package_path } => {
                vec!["/fvomus".to_string(), package_path.display().to_string()]
            }
            MsiOperation::Uninstall { product_code } => vec!["/x".to_string(), product_code.clone()],
        };
        args.push("/quiet".to_string());
        args.push("/norestart".to_string());
        if let Some(log) = &self.log_path {
            args.push("/l*v".to_string());
            args.push(log.display().to_string());
        }
        for (name, value, shown) in &self.properties {
            args.push(format!("{}={}", name, if display { shown } else { value }));
        }
        args.push("REBOOT=ReallySuppress".to_string());
        args
    }
}

impl InstallerArgs for MsiExecArgs {
    fn package_id(&self) -> &str {
        &self.package_id
    }

    fn program(&self) -> &Path {
        &self.msiexec
    }

    fn to_cli_args(&self) -> Vec<String> {
        self.build(false)
    }

    fn display_args(&self) -> Vec<String> {
        self.build(true)
    }
}

pub(super) fn configure(
    package: &Package,
    msi: &MsiPackage,
    action: ActionState,
    ctx: &mut InvocationContext<'_>,
) -> Result<MsiExecArgs> {
    let package_path = package.payload_path(ctx.cache_dir);
    let operation = match action {
        ActionState::Install => MsiOperation::Install { package_path },
        ActionState::Repair => MsiOperation::Repair { package_path },
        ActionState::Uninstall => MsiOperation::Uninstall {
            product_code: msi.product_code.clone(),
        },
        ActionState::None => {
            return Err(BurnError::planning(format!(
                "package '{}' has no action to configure",
                package.id
            )));
        }
    };

    // Uninstall only needs the product code; properties target the payload.
    let mut properties = Vec::new();
    if !matches!(operation, MsiOperation::Uninstall { .. }) {
        for prop in &msi.properties {
            let (value, shown) = format_pair(&mut *ctx.variables, &prop.value)?;
            properties.push((prop.id.clone(), value, shown));
        }
    }

    let log_path = ctx
        .config
        .installer_log_dir
        .as_ref()
        .map(|dir| dir.join(format!("{}_{}.log", package.id, action)));

    Ok(MsiExecArgs {
        package_id: package.id.clone(),
        msiexec: ctx.config.msiexec.clone(),
        operation,
        properties,
        log_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(operation: MsiOperation) -> MsiExecArgs {
        MsiExecArgs {
            package_id: "Core".into(),
            msiexec: PathBuf::from("msiexec"),
            operation,
            properties: vec![(
                "ADMINPASSWORD".into(),
                "s3cret".into(),
                "*****".into(),
            )],
            log_path: None,
        }
    }

    #[test]
    fn test_install_args() {
        let a = args(MsiOperation::Install {
            package_path: PathBuf::from("/cache/Core/core.msi"),
        });
        assert_eq!(
            a.to_cli_args(),
            vec![
                "/i",
                "/cache/Core/core.msi",
                "/quiet",
                "/norestart",
                "ADMINPASSWORD=s3cret",
                "REBOOT=ReallySuppress"
            ]
        );
        assert!(a.display_args().contains(&"ADMINPASSWORD=*****".to_string()));
    }

    #[test]
    fn test_uninstall_uses_product_code() {
        let a = args(MsiOperation::Uninstall {
            product_code: "{6F330B47-2577-43AD-9095-1861BA25889B}".into(),
        });
        let cli = a.to_cli_args();
        assert_eq!(cli[0], "/x");
        assert_eq!(cli[1], "{6F330B47-2577-43AD-9095-1861BA25889B}");
    }
}
