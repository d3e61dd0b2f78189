//! Typed installer invocations.
//!
//! Each package engine turns a planned action into a struct implementing
//! `InstallerArgs`. The struct is the single source of truth for the program,
//! its arguments and how its exit code is read, so the runner never builds a
//! command line by hand.

use crate::error::HResult;
use std::path::Path;

/// Restart demand reported by a finished installer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Restart {
    #[default]
    None,
    Required,
    Initiated,
}

/// Result of one installer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOutcome {
    pub hresult: HResult,
    pub restart: Restart,
}

impl ExecuteOutcome {
    pub const fn success() -> Self {
        Self {
            hresult: HResult::S_OK,
            restart: Restart::None,
        }
    }

    pub const fn failure(hresult: HResult) -> Self {
        Self {
            hresult,
            restart: Restart::None,
        }
    }

    #[inline]
    pub const fn is_success(&self) -> bool {
        self.hresult.is_success()
    }
}

/// Trait for typed installer arguments.
///
/// # Contract
///
/// - `program()`: the executable to launch.
/// - `to_cli_args()`: arguments exactly as the installer expects them; may
///   contain hidden variable values.
/// - `display_args()`: the same arguments with hidden values masked, for logs.
/// - `interpret_exit_code()`: maps the process exit code to an outcome.
pub trait InstallerArgs: Send {
    fn package_id(&self) -> &str;

    fn program(&self) -> &Path;

    fn to_cli_args(&self) -> Vec<String>;

    fn display_args(&self) -> Vec<String> {
        self.to_cli_args()
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn interpret_exit_code(&self, code: i32) -> ExecuteOutcome {
        standard_exit_code(code)
    }
}

/// Exit code conventions shared by Windows Installer and most setup programs.
pub fn standard_exit_code(code: i32) -> ExecuteOutcome {
    match code as u32 {
        0 => ExecuteOutcome::success(),
        HResult::ERROR_SUCCESS_REBOOT_REQUIRED => ExecuteOutcome {
            hresult: HResult::S_OK,
            restart: Restart::Required,
        },
        HResult::ERROR_SUCCESS_REBOOT_INITIATED => ExecuteOutcome {
            hresult: HResult::S_OK,
            restart: Restart::Initiated,
        },
        other => ExecuteOutcome::failure(HResult::from_win32(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_exit_codes() {
        assert_eq!(standard_exit_code(0), ExecuteOutcome::success());
        assert_eq!(standard_exit_code(3010).restart, Restart::Required);
        assert!(standard_exit_code(3010).is_success());
        assert_eq!(standard_exit_code(1641).restart, Restart::Initiated);
        assert_eq!(standard_exit_code(1602).hresult, HResult::E_INSTALL_USEREXIT);
        assert_eq!(standard_exit_code(1603).hresult, HResult::E_INSTALL_FAILURE);
    }

    #[test]
    fn test_negative_exit_code_is_hresult() {
        let outcome = standard_exit_code(HResult::E_FAIL.0);
        assert_eq!(outcome.hresult, HResult::E_FAIL);
    }
}
