//! Error handling module for the bundle engine
//!
//! Provides the engine's error taxonomy using thiserror, plus the `HResult`
//! status code that travels through UX callbacks, the elevation pipe and the
//! process exit code.

use std::fmt;
use thiserror::Error;

/// Windows-style status code carried by callbacks, pipe replies and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct HResult(pub i32);

impl HResult {
    pub const S_OK: Self = Self(0);
    pub const S_FALSE: Self = Self(1);
    pub const E_FAIL: Self = Self(0x8000_4005_u32 as i32);
    pub const E_INVALIDARG: Self = Self(0x8007_0057_u32 as i32);
    pub const E_UNEXPECTED: Self = Self(0x8000_FFFF_u32 as i32);
    pub const E_ACCESSDENIED: Self = Self(0x8007_0005_u32 as i32);
    pub const E_INVALIDDATA: Self = Self(0x8007_000D_u32 as i32);
    pub const E_NOTFOUND: Self = Self(0x8007_0490_u32 as i32);
    pub const E_BUSY: Self = Self(0x8007_00AA_u32 as i32);
    pub const E_BROKEN_PIPE: Self = Self(0x8007_006D_u32 as i32);
    pub const E_TIMEOUT: Self = Self(0x8007_05B4_u32 as i32);
    pub const E_CANCELLED: Self = Self(0x8007_04C7_u32 as i32);
    pub const E_INSTALL_USEREXIT: Self = Self(0x8007_0642_u32 as i32);
    pub const E_INSTALL_FAILURE: Self = Self(0x8007_0643_u32 as i32);

    /// Win32 code for "success, restart required".
    pub const ERROR_SUCCESS_REBOOT_REQUIRED: u32 = 3010;
    /// Win32 code for "success, restart initiated".
    pub const ERROR_SUCCESS_REBOOT_INITIATED: u32 = 1641;
    /// Win32 code for "user cancelled the installation".
    pub const ERROR_INSTALL_USEREXIT: u32 = 1602;

    /// Wrap a Win32 error code (`HRESULT_FROM_WIN32`).
    pub const fn from_win32(code: u32) -> Self {
        if code == 0 {
            Self::S_OK
        } else if (code as i32) <= 0 {
            Self(code as i32)
        } else {
            Self(((code & 0xFFFF) | 0x8007_0000) as i32)
        }
    }

    #[inline]
    pub const fn is_success(self) -> bool {
        self.0 >= 0
    }

    #[inline]
    pub const fn is_failure(self) -> bool {
        self.0 < 0
    }

    /// Returns the Win32 code if this is a FACILITY_WIN32 failure.
    pub const fn win32_code(self) -> Option<u32> {
        let raw = self.0 as u32;
        if raw & 0xFFFF_0000 == 0x8007_0000 {
            Some(raw & 0xFFFF)
        } else {
            None
        }
    }

    /// Process exit code for this status.
    ///
    /// Success maps to 0, Win32 failures to their Win32 code, everything else
    /// to the raw HRESULT bits.
    pub fn exit_code(self) -> i32 {
        if self.is_success() {
            0
        } else {
            self.win32_code().map(|c| c as i32).unwrap_or(self.0)
        }
    }
}

impl Default for HResult {
    fn default() -> Self {
        Self::S_OK
    }
}

impl fmt::Display for HResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0 as u32)
    }
}

/// Main error type for the bundle engine
#[derive(Error, Debug)]
pub enum BurnError {
    /// IO errors (registration store, cache, process spawning)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed manifest or package descriptor (fatal to bundle load)
    #[error("Manifest parse error: {0}")]
    Parse(String),

    /// Per-package detection failure (non-fatal, package becomes Unknown)
    #[error("Detection of package '{package}' failed: {reason}")]
    Detection { package: String, reason: String },

    /// Invalid state transition while planning (fatal to the plan)
    #[error("Planning error: {0}")]
    Planning(String),

    /// Installer invocation failed
    #[error("Package '{package}' failed with {hresult}: {reason}")]
    Configuration {
        package: String,
        hresult: HResult,
        reason: String,
    },

    /// Elevation pipe failure
    #[error("Pipe communication error: {0}")]
    Communication(String),

    /// Failed to launch or authenticate the elevated companion
    #[error("Elevation error: {0}")]
    Elevation(String),

    /// Registration store or resume state errors
    #[error("Registration error: {0}")]
    Registration(String),

    /// Condition expression errors
    #[error("Condition error: {0}")]
    Condition(String),

    /// Variable store errors (type mismatch, read-only built-in)
    #[error("Variable error: {0}")]
    Variable(String),

    /// Payload cache errors
    #[error("Cache error: {0}")]
    Cache(String),

    /// Engine state errors (engine busy, poisoned lock)
    #[error("State error: {0}")]
    State(String),

    /// Engine phase machine transition errors
    #[error("Phase transition error: {0}")]
    Phase(String),

    /// Configuration file errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The user or a callback cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary state blob encoding errors
    #[error("State blob error: {0}")]
    StateBlob(#[from] postcard::Error),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, BurnError>;

impl BurnError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn detection(package: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Detection {
            package: package.into(),
            reason: reason.into(),
        }
    }

    pub fn planning(msg: impl Into<String>) -> Self {
        Self::Planning(msg.into())
    }

    pub fn configuration(
        package: impl Into<String>,
        hresult: HResult,
        reason: impl Into<String>,
    ) -> Self {
        Self::Configuration {
            package: package.into(),
            hresult,
            reason: reason.into(),
        }
    }

    pub fn communication(msg: impl Into<String>) -> Self {
        Self::Communication(msg.into())
    }

    pub fn elevation(msg: impl Into<String>) -> Self {
        Self::Elevation(msg.into())
    }

    pub fn registration(msg: impl Into<String>) -> Self {
        Self::Registration(msg.into())
    }

    pub fn condition(msg: impl Into<String>) -> Self {
        Self::Condition(msg.into())
    }

    pub fn variable(msg: impl Into<String>) -> Self {
        Self::Variable(msg.into())
    }

    pub fn cache(msg: impl Into<String>) -> Self {
        Self::Cache(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// The status code reported to the UX and used for the exit code.
    pub fn hresult(&self) -> HResult {
        match self {
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => HResult::E_NOTFOUND,
                std::io::ErrorKind::PermissionDenied => HResult::E_ACCESSDENIED,
                std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::UnexpectedEof => {
                    HResult::E_BROKEN_PIPE
                }
                std::io::ErrorKind::TimedOut => HResult::E_TIMEOUT,
                _ => HResult::E_FAIL,
            },
            Self::Parse(_) | Self::StateBlob(_) | Self::Json(_) => HResult::E_INVALIDDATA,
            Self::Detection { .. } => HResult::E_FAIL,
            Self::Planning(_) | Self::Phase(_) => HResult::E_UNEXPECTED,
            Self::Configuration { hresult, .. } => *hresult,
            Self::Communication(_) => HResult::E_BROKEN_PIPE,
            Self::Elevation(_) => HResult::E_ACCESSDENIED,
            Self::Condition(_) | Self::Variable(_) | Self::Config(_) => HResult::E_INVALIDARG,
            Self::Registration(_) | Self::Cache(_) => HResult::E_FAIL,
            Self::State(_) => HResult::E_BUSY,
            Self::Cancelled => HResult::E_INSTALL_USEREXIT,
        }
    }

    /// Returns true if this error aborts bundle load.
    pub fn is_fatal_to_load(&self) -> bool {
        matches!(self, Self::Parse(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BurnError::parse("missing Id attribute");
        assert_eq!(err.to_string(), "Manifest parse error: missing Id attribute");

        let err = BurnError::configuration("NetFx", HResult::E_INSTALL_FAILURE, "exit code 1603");
        assert_eq!(
            err.to_string(),
            "Package 'NetFx' failed with 0x80070643: exit code 1603"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: BurnError = io_err.into();
        assert!(matches!(err, BurnError::Io(_)));
        assert_eq!(err.hresult(), HResult::E_NOTFOUND);
    }

    #[test]
    fn test_hresult_from_win32() {
        assert_eq!(HResult::from_win32(0), HResult::S_OK);
        assert_eq!(HResult::from_win32(1603), HResult::E_INSTALL_FAILURE);
        assert_eq!(HResult::from_win32(1602), HResult::E_INSTALL_USEREXIT);
        assert_eq!(HResult::from_win32(1603).win32_code(), Some(1603));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(HResult::S_OK.exit_code(), 0);
        assert_eq!(HResult::E_INSTALL_FAILURE.exit_code(), 1603);
        assert_eq!(HResult::E_FAIL.exit_code(), HResult::E_FAIL.0);
    }

    #[test]
    fn test_cancel_maps_to_user_exit() {
        assert_eq!(BurnError::Cancelled.hresult(), HResult::E_INSTALL_USEREXIT);
        assert!(BurnError::Cancelled.hresult().is_failure());
    }

    #[test]
    fn test_hresult_display() {
        assert_eq!(HResult::E_FAIL.to_string(), "0x80004005");
        assert_eq!(HResult::S_OK.to_string(), "0x00000000");
    }
}
