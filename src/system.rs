//! Machine state queries
//!
//! Everything the engine asks of the operating system during Detect goes
//! through `SystemProbe`: product registrations, installed updates, registry
//! values, file versions, privilege and boot session. Tests substitute their
//! own probe; `HostSystem` answers for the machine the engine runs on.

use crate::error::Result;
use crate::variables::Variant;
use crate::version::Version;
use std::path::Path;
use strum::{Display, EnumString};

/// Registry hive used by registry searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum RegistryRoot {
    #[strum(serialize = "HKLM")]
    LocalMachine,
    #[strum(serialize = "HKCU")]
    CurrentUser,
    #[strum(serialize = "HKCR")]
    ClassesRoot,
    #[strum(serialize = "HKU")]
    Users,
}

/// A product registered under an upgrade code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedProduct {
    pub product_code: String,
    pub version: Version,
}

/// Read-only view of machine state.
pub trait SystemProbe: Send + Sync {
    /// Installed version of an MSI product, `None` when not installed.
    fn msi_product_version(&self, product_code: &str) -> Result<Option<Version>>;

    /// Products installed under an upgrade code.
    fn msi_related_products(&self, upgrade_code: &str) -> Result<Vec<RelatedProduct>>;

    /// Whether the update identified by `kb` (e.g. "KB2919355") is installed.
    fn qfe_installed(&self, kb: &str) -> Result<bool>;

    /// A registry value; `value = None` reads the key's default value.
    fn registry_value(
        &self,
        root: RegistryRoot,
        key: &str,
        value: Option<&str>,
    ) -> Result<Option<Variant>>;

    fn file_exists(&self, path: &Path) -> bool;

    /// Embedded version of a file, `None` when the file is missing or unversioned.
    fn file_version(&self, path: &Path) -> Result<Option<Version>>;

    /// Whether this process may perform per-machine work without elevation.
    fn is_privileged(&self) -> bool;

    /// Identifier of the current boot; changes after a restart.
    fn boot_session_id(&self) -> Option<String>;
}

/// Probe for the host the engine is running on.
///
/// Product, update and registry databases belong to Windows Installer; on
/// hosts without them every product reads as not installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostSystem;

impl SystemProbe for HostSystem {
    fn msi_product_version(&self, product_code: &str) -> Result<Option<Version>> {
        tracing::debug!("No product database on this host; {} reads absent", product_code);
        Ok(None)
    }

    fn msi_related_products(&self, _upgrade_code: &str) -> Result<Vec<RelatedProduct>> {
        Ok(Vec::new())
    }

    fn qfe_installed(&self, kb: &str) -> Result<bool> {
        tracing::debug!("No update database on this host; {} reads absent", kb);
        Ok(false)
    }

    fn registry_value(
        &self,
        root: RegistryRoot,
        key: &str,
        _value: Option<&str>,
    ) -> Result<Option<Variant>> {
        tracing::debug!("No registry on this host; {}\\{} reads missing", root, key);
        Ok(None)
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn file_version(&self, path: &Path) -> Result<Option<Version>> {
        // Version resources are a PE feature; existing files carry none here.
        match std::fs::metadata(path) {
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn is_privileged(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    fn boot_session_id(&self) -> Option<String> {
        std::fs::read_to_string("/proc/sys/kernel/random/boot_id")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}
