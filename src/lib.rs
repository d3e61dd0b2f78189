//! Burn bundle engine
//!
//! Chains MSI, EXE and MSU packages into one bundle: detects what is
//! installed, plans the actions a bundle action needs and applies them with
//! rollback, registration and resume across restarts. Per-machine packages
//! run in an elevated companion reached over a framed pipe.

pub mod cache;
pub mod cli;
pub mod condition;
pub mod config;
pub mod elevation;
pub mod engine;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod package;
pub mod process_guard;
pub mod registration;
pub mod runner;
pub mod search;
pub mod state;
pub mod system;
pub mod types;
pub mod ux;
pub mod variables;
pub mod version;

// Re-export main types for convenience
pub use config::EngineConfig;
pub use engine::{BurnCore, CoreHandle, Engine, EngineHost, EnginePhase, RunSummary};
pub use error::{BurnError, HResult, Result};
pub use manifest::Manifest;
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use types::{ActionState, BundleAction, PackageState, RequestState, ResumeType, UxCommand};
pub use ux::{ConsoleUx, UserExperience};
pub use variables::{Variables, Variant};
pub use version::Version;
