//! Chained packages and the per-technology engines
//!
//! A `Package` is the normalized descriptor every phase works on. Technology
//! specifics (how to detect, which installer to run, which actions are
//! possible) live in the `msi`, `exe` and `msu` engines; this module holds the
//! shared descriptor, the manifest attribute helpers and the plan table.
//!
//! # Plan table
//!
//! | current    | requested | execute   | rollback  |
//! |------------|-----------|-----------|-----------|
//! | Present    | Absent    | Uninstall | Install   |
//! | Present    | Present   | None      | None      |
//! | Present    | Repair    | Repair    | None      |
//! | Absent     | Present   | Install   | Uninstall |
//! | Absent     | Repair    | Install   | Uninstall |
//! | Absent     | Absent    | None      | None      |
//! | Superseded | any       | None      | None      |
//! | Obsolete   | any       | None      | None      |
//! | Unknown    | None      | None      | None      |
//! | Unknown    | other     | error                 |
//!
//! Permanent packages never uninstall; packages without a repair command
//! never repair.

pub mod exe;
pub mod invocation;
pub mod msi;
pub mod msu;

use crate::config::EngineConfig;
use crate::error::{BurnError, Result};
use crate::system::SystemProbe;
use crate::types::{ActionState, PackageState, PackageType, RequestState};
use crate::variables::{VariableSource, Variables};
use crate::version::Version;
use invocation::InstallerArgs;
use roxmltree::Node;
use std::path::{Path, PathBuf};

pub use exe::ExePackage;
pub use msi::{MsiPackage, MsiProperty};
pub use msu::MsuPackage;

/// Technology-specific part of a package.
#[derive(Debug, Clone, PartialEq)]
pub enum PackageKind {
    Msi(MsiPackage),
    Exe(ExePackage),
    Msu(MsuPackage),
}

/// A chained package.
///
/// Manifest fields are set by the parser and never change. `current` is
/// written by Detect; `requested`, `execute` and `rollback` by Plan. Apply
/// only reads.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    pub id: String,
    /// Failure of a vital package fails (and rolls back) the whole apply
    pub vital: bool,
    pub per_machine: bool,
    /// Permanent packages are never uninstalled, not even on rollback
    pub permanent: bool,
    pub file_name: String,
    pub file_size: Option<u64>,
    pub install_condition: Option<String>,
    pub kind: PackageKind,

    pub current: PackageState,
    pub requested: RequestState,
    pub execute: ActionState,
    pub rollback: ActionState,
}

impl Package {
    pub fn package_type(&self) -> PackageType {
        match self.kind {
            PackageKind::Msi(_) => PackageType::Msi,
            PackageKind::Exe(_) => PackageType::Exe,
            PackageKind::Msu(_) => PackageType::Msu,
        }
    }

    /// Whether a repair action exists for this package.
    pub fn is_repairable(&self) -> bool {
        match &self.kind {
            PackageKind::Msi(_) => true,
            PackageKind::Exe(exe) => exe.repair_arguments.is_some(),
            PackageKind::Msu(_) => false,
        }
    }

    /// Whether this package may be uninstalled.
    pub fn is_uninstallable(&self) -> bool {
        if self.permanent {
            return false;
        }
        match &self.kind {
            PackageKind::Msi(_) => true,
            PackageKind::Exe(exe) => exe.uninstall_arguments.is_some(),
            PackageKind::Msu(msu) => msu.kb.is_some(),
        }
    }

    /// Version recorded in the manifest, if any.
    pub fn version(&self) -> Option<Version> {
        match &self.kind {
            PackageKind::Msi(msi) => Some(msi.product_version),
            PackageKind::Exe(exe) => exe.product_version,
            PackageKind::Msu(_) => None,
        }
    }

    /// Location of this package's payload inside a cache or layout directory.
    pub fn payload_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.id).join(&self.file_name)
    }

    /// Clear everything Detect and Plan wrote.
    pub fn reset_state(&mut self) {
        self.current = PackageState::Unknown;
        self.reset_plan();
    }

    pub fn reset_plan(&mut self) {
        self.requested = RequestState::None;
        self.execute = ActionState::None;
        self.rollback = ActionState::None;
    }
}

/// What detection may consult.
pub struct DetectContext<'a> {
    pub probe: &'a dyn SystemProbe,
    pub variables: &'a Variables,
}

/// Where an installer invocation reads its payload and writes its log.
pub struct InvocationContext<'a> {
    pub config: &'a EngineConfig,
    /// Directory holding cached payloads (`<cache>/<package id>/<file>`)
    pub cache_dir: &'a Path,
    pub variables: &'a mut dyn VariableSource,
}

/// Parse one chain element into a package.
pub fn parse_package(node: Node<'_, '_>) -> Result<Package> {
    let id = required_attr(node, "Id")?.to_string();
    crate::variables::validate_name(&id)
        .map_err(|_| BurnError::parse(format!("invalid package Id '{}'", id)))?;

    let kind = match node.tag_name().name() {
        "MsiPackage" => PackageKind::Msi(msi::parse(node, &id)?),
        "ExePackage" => PackageKind::Exe(exe::parse(node, &id)?),
        "MsuPackage" => PackageKind::Msu(msu::parse(node, &id)?),
        other => {
            return Err(BurnError::parse(format!(
                "unknown chain element <{}> for package '{}'",
                other, id
            )));
        }
    };

    let file_size = match node.attribute("FileSize") {
        Some(size) => Some(size.trim().parse().map_err(|_| {
            BurnError::parse(format!("package '{}' has invalid FileSize '{}'", id, size))
        })?),
        None => None,
    };

    let install_condition = node.attribute("InstallCondition").map(str::to_string);
    if let Some(condition) = &install_condition {
        crate::condition::validate(condition).map_err(|e| {
            BurnError::parse(format!("package '{}' InstallCondition: {}", id, e))
        })?;
    }

    Ok(Package {
        vital: yes_no(node, "Vital", true)?,
        per_machine: yes_no(node, "PerMachine", false)?,
        permanent: yes_no(node, "Permanent", false)?,
        file_name: required_attr(node, "FileName")?.to_string(),
        file_size,
        install_condition,
        kind,
        current: PackageState::Unknown,
        requested: RequestState::None,
        execute: ActionState::None,
        rollback: ActionState::None,
        id,
    })
}

/// Query the machine for the package's current state.
pub fn detect_package(package: &Package, ctx: &DetectContext<'_>) -> Result<PackageState> {
    match &package.kind {
        PackageKind::Msi(msi) => msi::detect(&package.id, msi, ctx),
        PackageKind::Exe(exe) => exe::detect(&package.id, exe, ctx),
        PackageKind::Msu(msu) => msu::detect(&package.id, msu, ctx),
    }
}

/// Map (current, requested) to (execute, rollback).
pub fn plan_package(
    package: &Package,
    requested: RequestState,
) -> Result<(ActionState, ActionState)> {
    use ActionState as A;
    use PackageState as S;
    use RequestState as R;

    let (execute, rollback) = match (package.current, requested) {
        (_, R::None) => (A::None, A::None),
        (S::Unknown, other) => {
            return Err(BurnError::planning(format!(
                "cannot plan {} for package '{}' whose state is unknown",
                other, package.id
            )));
        }
        (S::Superseded | S::Obsolete, _) => (A::None, A::None),
        (S::Present, R::Absent) => (A::Uninstall, A::Install),
        (S::Present, R::Present) => (A::None, A::None),
        (S::Present, R::Repair) => (A::Repair, A::None),
        (S::Absent, R::Present | R::Repair) => (A::Install, A::Uninstall),
        (S::Absent, R::Absent) => (A::None, A::None),
    };

    let execute = match execute {
        A::Uninstall if !package.is_uninstallable() => A::None,
        A::Repair if !package.is_repairable() => A::None,
        other => other,
    };
    let rollback = match (execute, rollback) {
        (A::None, _) => A::None,
        (_, A::Uninstall) if !package.is_uninstallable() => A::None,
        (_, other) => other,
    };

    Ok((execute, rollback))
}

/// Build the installer invocation for `action` on `package`.
pub fn configure_package(
    package: &Package,
    action: ActionState,
    ctx: &mut InvocationContext<'_>,
) -> Result<Box<dyn InstallerArgs>> {
    if action.is_none() {
        return Err(BurnError::planning(format!(
            "package '{}' has no action to configure",
            package.id
        )));
    }
    match &package.kind {
        PackageKind::Msi(msi) => Ok(Box::new(msi::configure(package, msi, action, ctx)?)),
        PackageKind::Exe(exe) => Ok(Box::new(exe::configure(package, exe, action, ctx)?)),
        PackageKind::Msu(msu) => Ok(Box::new(msu::configure(package, msu, action, ctx)?)),
    }
}

// ============================================================================
// Manifest attribute helpers
// ============================================================================

pub(crate) fn required_attr<'a>(node: Node<'a, '_>, name: &str) -> Result<&'a str> {
    match node.attribute(name) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(BurnError::parse(format!(
            "<{}> is missing required attribute {}{}",
            node.tag_name().name(),
            name,
            node.attribute("Id")
                .map(|id| format!(" (Id '{}')", id))
                .unwrap_or_default()
        ))),
    }
}

pub(crate) fn yes_no(node: Node<'_, '_>, name: &str, default: bool) -> Result<bool> {
    match node.attribute(name) {
        None => Ok(default),
        Some(v) if v.eq_ignore_ascii_case("yes") => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("no") => Ok(false),
        Some(v) => Err(BurnError::parse(format!(
            "attribute {}='{}' on <{}> must be 'yes' or 'no'",
            name,
            v,
            node.tag_name().name()
        ))),
    }
}

pub(crate) fn parse_version_attr(node: Node<'_, '_>, name: &str, id: &str) -> Result<Version> {
    let raw = required_attr(node, name)?;
    raw.parse::<Version>().map_err(|e| {
        BurnError::parse(format!("package '{}' has invalid {}: {}", id, name, e))
    })
}

/// Validate and normalize a GUID to `{XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX}`.
pub(crate) fn parse_guid(raw: &str, what: &str, id: &str) -> Result<String> {
    let trimmed = raw.trim();
    let inner = trimmed
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .unwrap_or(trimmed);
    if inner.len() != 36 {
        return Err(BurnError::parse(format!(
            "package '{}' has malformed {} '{}'",
            id, what, raw
        )));
    }
    let guid = uuid::Uuid::parse_str(inner).map_err(|_| {
        BurnError::parse(format!("package '{}' has malformed {} '{}'", id, what, raw))
    })?;
    Ok(format!("{{{}}}", guid.hyphenated().to_string().to_uppercase()))
}

/// Split an argument string the way a command line is split: whitespace
/// separates, double quotes group, quotes are removed.
pub fn split_arguments(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}
