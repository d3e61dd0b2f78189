//! Shared engine enums
//!
//! Typed states and actions used by the package engines, the planner, the
//! registration store and the UX surface. String forms come from strum so the
//! CLI, logs and manifest all agree on spelling.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// The bundle-wide action requested of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BundleAction {
    /// Copy payloads into the cache without executing anything
    Layout,
    Uninstall,
    #[default]
    Install,
    Modify,
    Repair,
}

impl BundleAction {
    /// Numeric code published through the `WixBundleAction` variable.
    pub const fn code(self) -> i64 {
        match self {
            Self::Layout => 2,
            Self::Uninstall => 3,
            Self::Install => 4,
            Self::Modify => 5,
            Self::Repair => 6,
        }
    }

    /// Default per-package request for this bundle action.
    pub const fn default_request(self) -> RequestState {
        match self {
            Self::Layout => RequestState::None,
            Self::Uninstall => RequestState::Absent,
            Self::Install | Self::Modify => RequestState::Present,
            Self::Repair => RequestState::Repair,
        }
    }
}

/// Installer technology of a chained package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
pub enum PackageType {
    #[strum(serialize = "MSI")]
    Msi,
    #[strum(serialize = "EXE")]
    Exe,
    #[strum(serialize = "MSU")]
    Msu,
}

/// Detected state of a package on the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
pub enum PackageState {
    /// Detection failed or has not run
    #[default]
    Unknown,
    Absent,
    Present,
    /// A newer version of the same product is installed
    Superseded,
    /// A newer related product replaces this package
    Obsolete,
}

/// What the plan asks of a single package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
pub enum RequestState {
    #[default]
    None,
    /// Uninstall
    Absent,
    /// Install
    Present,
    Repair,
}

/// Concrete installer operation for a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
pub enum ActionState {
    #[default]
    None,
    Install,
    Uninstall,
    Repair,
}

impl ActionState {
    #[inline]
    pub const fn is_none(self) -> bool {
        matches!(self, Self::None)
    }

    /// State the package is left in when this action succeeds.
    pub const fn resulting_state(self, current: PackageState) -> PackageState {
        match self {
            Self::Install | Self::Repair => PackageState::Present,
            Self::Uninstall => PackageState::Absent,
            Self::None => current,
        }
    }
}

/// Persisted resume mode of a bundle registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
pub enum ResumeMode {
    /// Not resumable
    #[default]
    None,
    /// A session is running (or crashed while running)
    Active,
    /// The session was suspended on purpose
    Suspend,
    /// The bundle is installed and shows in Add/Remove Programs
    Arp,
    /// The session waits for a restart
    RebootPending,
}

/// Classification of how this run relates to a previous session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
pub enum ResumeType {
    /// Fresh run, nothing registered
    #[default]
    None,
    /// Registration exists but cannot be read
    Invalid,
    /// The previous session ended without unregistering (crash)
    Unexpected,
    Suspend,
    /// Launched from Add/Remove Programs
    Arp,
    /// The restart the previous session asked for has happened
    Reboot,
    /// The restart the previous session asked for has not happened yet
    RebootPending,
}

impl ResumeType {
    /// Resume types that restore the persisted state blob.
    pub const fn restores_state(self) -> bool {
        matches!(
            self,
            Self::Unexpected | Self::Suspend | Self::Reboot | Self::RebootPending
        )
    }
}

/// Log levels accepted from the UX.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    None,
    #[default]
    Standard,
    Verbose,
    Debug,
    Error,
}

/// Answer a UX callback gives the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[derive(Display, EnumString)]
pub enum UxCommand {
    #[default]
    Ok,
    Cancel,
    /// Run the failed package again
    Retry,
    /// Treat the failure as non-vital
    Ignore,
    /// Restart the machine at shutdown
    Restart,
}

impl UxCommand {
    #[inline]
    pub const fn is_cancel(self) -> bool {
        matches!(self, Self::Cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_bundle_action_parse_is_case_insensitive() {
        assert_eq!(BundleAction::from_str("Install").unwrap(), BundleAction::Install);
        assert_eq!(BundleAction::from_str("UNINSTALL").unwrap(), BundleAction::Uninstall);
        assert!(BundleAction::from_str("explode").is_err());
    }

    #[test]
    fn test_bundle_action_codes_are_unique() {
        let mut codes: Vec<i64> = BundleAction::iter().map(|a| a.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), BundleAction::iter().count());
    }

    #[test]
    fn test_default_requests() {
        assert_eq!(BundleAction::Install.default_request(), RequestState::Present);
        assert_eq!(BundleAction::Uninstall.default_request(), RequestState::Absent);
        assert_eq!(BundleAction::Repair.default_request(), RequestState::Repair);
        assert_eq!(BundleAction::Layout.default_request(), RequestState::None);
    }

    #[test]
    fn test_resulting_state() {
        assert_eq!(
            ActionState::Install.resulting_state(PackageState::Absent),
            PackageState::Present
        );
        assert_eq!(
            ActionState::Uninstall.resulting_state(PackageState::Present),
            PackageState::Absent
        );
        assert_eq!(
            ActionState::None.resulting_state(PackageState::Superseded),
            PackageState::Superseded
        );
    }

    #[test]
    fn test_package_type_display() {
        assert_eq!(PackageType::Msi.to_string(), "MSI");
        assert_eq!(PackageType::from_str("MSU").unwrap(), PackageType::Msu);
    }
}
