//! Setup programs with their own command line.
//!
//! An EXE package has no product database entry, so its state comes from a
//! `DetectCondition` evaluated over variables (usually fed by a file or
//! registry search). Install, repair and uninstall run the cached executable
//! with the matching formatted argument string.

use super::invocation::InstallerArgs;
use super::{DetectContext, InvocationContext, Package, split_arguments};
use crate::error::{BurnError, Result};
use crate::types::{ActionState, PackageState};
use crate::variables::format_pair;
use crate::version::Version;
use roxmltree::Node;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct ExePackage {
    pub detect_condition: String,
    pub product_version: Option<Version>,
    pub install_arguments: String,
    /// `None` when the program cannot repair itself
    pub repair_arguments: Option<String>,
    /// `None` when the program cannot uninstall itself
    pub uninstall_arguments: Option<String>,
}

pub(super) fn parse(node: Node<'_, '_>, id: &str) -> Result<ExePackage> {
    // Either a DetectCondition attribute or a <DetectionCondition> child.
    let detect_condition = node
        .attribute("DetectCondition")
        .map(str::to_string)
        .or_else(|| {
            node.children()
                .find(|n| n.has_tag_name("DetectionCondition"))
                .map(|n| n.text().unwrap_or_default().trim().to_string())
        })
        .filter(|c| !c.is_empty())
        .ok_or_else(|| {
            BurnError::parse(format!("ExePackage '{}' is missing a detection condition", id))
        })?;
    crate::condition::validate(&detect_condition)
        .map_err(|e| BurnError::parse(format!("ExePackage '{}' detection condition: {}", id, e)))?;

    let product_version = node
        .attribute("ProductVersion")
        .map(|raw| {
            raw.parse::<Version>().map_err(|e| {
                BurnError::parse(format!("package '{}' has invalid ProductVersion: {}", id, e))
            })
        })
        .transpose()?;

    Ok(ExePackage {
        detect_condition,
        product_version,
        install_arguments: node.attribute("InstallArguments").unwrap_or_default().to_string(),
        repair_arguments: node.attribute("RepairArguments").map(str::to_string),
        uninstall_arguments: node.attribute("UninstallArguments").map(str::to_string),
    })
}

pub(super) fn detect(id: &str, exe: &ExePackage, ctx: &DetectContext<'_>) -> Result<PackageState> {
    let present = crate::condition::evaluate(&exe.detect_condition, ctx.variables)
        .map_err(|e| BurnError::detection(id, e.to_string()))?;
    tracing::debug!(
        "EXE {}: condition '{}' -> {}",
        id,
        exe.detect_condition,
        present
    );
    Ok(if present {
        PackageState::Present
    } else {
        PackageState::Absent
    })
}

/// Invocation of the package's own executable.
#[derive(Debug, Clone)]
pub struct ExeArgs {
    pub package_id: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub shown_args: Vec<String>,
}

impl InstallerArgs for ExeArgs {
    fn package_id(&self) -> &str {
        &self.package_id
    }

    fn program(&self) -> &Path {
        &self.executable
    }

    fn to_cli_args(&self) -> Vec<String> {
        self.args.clone()
    }

    fn display_args(&self) -> Vec<String> {
        self.shown_args.clone()
    }
}

pub(super) fn configure(
    package: &Package,
    exe: &ExePackage,
    action: ActionState,
    ctx: &mut InvocationContext<'_>,
) -> Result<ExeArgs> {
    let template = match action {
        ActionState::Install => Some(&exe.install_arguments),
        ActionState::Repair => exe.repair_arguments.as_ref(),
        ActionState::Uninstall => exe.uninstall_arguments.as_ref(),
        ActionState::None => None,
    }
    .ok_or_else(|| {
        BurnError::planning(format!("package '{}' does not support {}", package.id, action))
    })?;

    let (formatted, shown) = format_pair(&mut *ctx.variables, template)?;

    Ok(ExeArgs {
        package_id: package.id.clone(),
        executable: package.payload_path(ctx.cache_dir),
        args: split_arguments(&formatted),
        shown_args: split_arguments(&shown),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::{Variables, Variant};

    #[test]
    fn test_detect_uses_condition() {
        let exe = ExePackage {
            detect_condition: "RuntimeVersion >= v2.0".into(),
            product_version: None,
            install_arguments: String::new(),
            repair_arguments: None,
            uninstall_arguments: None,
        };
        let probe = crate::system::HostSystem;
        let mut vars = Variables::new();

        let ctx = DetectContext {
            probe: &probe,
            variables: &vars,
        };
        assert_eq!(detect("Runtime", &exe, &ctx).unwrap(), PackageState::Absent);

        vars.set("RuntimeVersion", Variant::Version(Version::new(2, 1, 0, 0)))
            .unwrap();
        let ctx = DetectContext {
            probe: &probe,
            variables: &vars,
        };
        assert_eq!(detect("Runtime", &exe, &ctx).unwrap(), PackageState::Present);
    }

    #[test]
    fn test_bad_condition_is_detection_error() {
        let exe = ExePackage {
            detect_condition: "RuntimeVersion >= v2.0".into(),
            product_version: None,
            install_arguments: String::new(),
            repair_arguments: None,
            uninstall_arguments: None,
        };
        let probe = crate::system::HostSystem;
        let mut vars = Variables::new();
        vars.set("RuntimeVersion", Variant::String("not a version".into()))
            .unwrap();
        let ctx = DetectContext {
            probe: &probe,
            variables: &vars,
        };
        assert!(matches!(
            detect("Runtime", &exe, &ctx),
            Err(BurnError::Detection { .. })
        ));
    }
}
