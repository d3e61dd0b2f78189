//! Bundle registration and resumable session state
//!
//! One record per bundle, keyed by bundle id. The record carries the ARP
//! (programs list) metadata and the resume mode; next to it lives the opaque
//! state blob. Resume modes only move forward within a session:
//!
//! ```text
//! None -> Active -> Suspend | RebootPending | Arp -> (next run resumes) -> ended
//! ```
//!
//! Suspending always writes the state blob before the resume mode, so a
//! record that says "resumable" never points at a missing or stale blob.

use crate::error::{BurnError, Result};
use crate::manifest::Registration;
use crate::state::EngineSnapshot;
use crate::types::{ResumeMode, ResumeType};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const RECORD_FILE: &str = "registration.json";
const STATE_FILE: &str = "state.bin";

/// The persisted registration record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub bundle_id: String,
    pub name: String,
    pub version: String,
    pub publisher: Option<String>,
    pub per_machine: bool,
    pub resume_mode: ResumeMode,
    /// Boot session that must end before a pending restart counts as done
    pub reboot_boot_id: Option<String>,
    /// A previous session completed and left the bundle installed
    pub installed: bool,
}

/// How a session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Keep the bundle in the programs list
    Keep,
    /// Forget the bundle (uninstalled, or a first install rolled back)
    Remove,
}

pub trait RegistrationStore: Send {
    /// Write or update the record, mark the session Active and save `snapshot`.
    fn session_begin(&mut self, registration: &Registration, snapshot: &EngineSnapshot) -> Result<()>;

    /// Save `snapshot`, then mark the session Suspend, or RebootPending when
    /// `reboot_boot_id` is given.
    fn session_suspend(&mut self, snapshot: &EngineSnapshot, reboot_boot_id: Option<&str>) -> Result<()>;

    /// Clear resumable state and either finalize to Arp or remove the record.
    fn session_end(&mut self, end: SessionEnd) -> Result<()>;

    /// Classify this run against the stored record.
    fn detect_resume_type(&self, current_boot_id: Option<&str>) -> ResumeType;

    fn save_state(&mut self, snapshot: &EngineSnapshot) -> Result<()>;

    fn load_state(&self) -> Result<Option<EngineSnapshot>>;

    fn record(&self) -> Result<Option<RegistrationRecord>>;
}

/// Registration kept as files under one directory per bundle.
#[derive(Debug, Clone)]
pub struct FileRegistrationStore {
    dir: PathBuf,
}

impl FileRegistrationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self) -> PathBuf {
        self.dir.join(RECORD_FILE)
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn write_record(&self, record: &RegistrationRecord) -> Result<()> {
        let json = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.record_path(), &json)
    }

    fn require_record(&self) -> Result<RegistrationRecord> {
        self.record()?
            .ok_or_else(|| BurnError::registration("no session has begun for this bundle"))
    }
}

impl RegistrationStore for FileRegistrationStore {
    fn session_begin(&mut self, registration: &Registration, snapshot: &EngineSnapshot) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let installed = match self.record() {
            Ok(Some(existing)) => existing.installed,
            _ => false,
        };

        self.save_state(snapshot)?;
        self.write_record(&RegistrationRecord {
            bundle_id: registration.id.clone(),
            name: registration.name.clone(),
            version: registration.version.to_string(),
            publisher: registration.publisher.clone(),
            per_machine: registration.per_machine,
            resume_mode: ResumeMode::Active,
            reboot_boot_id: None,
            installed,
        })?;
        tracing::info!("Session begun for bundle {}", registration.id);
        Ok(())
    }

    fn session_suspend(&mut self, snapshot: &EngineSnapshot, reboot_boot_id: Option<&str>) -> Result<()> {
        let mut record = self.require_record()?;
        self.save_state(snapshot)?;

        record.resume_mode = match reboot_boot_id {
            Some(_) => ResumeMode::RebootPending,
            None => ResumeMode::Suspend,
        };
        record.reboot_boot_id = reboot_boot_id.map(str::to_string);
        self.write_record(&record)?;
        tracing::info!("Session suspended ({})", record.resume_mode);
        Ok(())
    }

    fn session_end(&mut self, end: SessionEnd) -> Result<()> {
        match end {
            SessionEnd::Remove => {
                match fs::remove_dir_all(&self.dir) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                tracing::info!("Registration removed");
            }
            SessionEnd::Keep => {
                let mut record = self.require_record()?;
                match fs::remove_file(self.state_path()) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                record.resume_mode = ResumeMode::Arp;
                record.reboot_boot_id = None;
                record.installed = true;
                self.write_record(&record)?;
                tracing::info!("Registration finalized for the programs list");
            }
        }
        Ok(())
    }

    fn detect_resume_type(&self, current_boot_id: Option<&str>) -> ResumeType {
        let record = match self.record() {
            Ok(Some(record)) => record,
            Ok(None) => return ResumeType::None,
            Err(e) => {
                tracing::warn!("Registration record unreadable: {}", e);
                return ResumeType::Invalid;
            }
        };

        match record.resume_mode {
            ResumeMode::None => ResumeType::None,
            ResumeMode::Active => ResumeType::Unexpected,
            ResumeMode::Suspend => ResumeType::Suspend,
            ResumeMode::Arp => ResumeType::Arp,
            ResumeMode::RebootPending => match (record.reboot_boot_id.as_deref(), current_boot_id) {
                (Some(marker), Some(current)) if marker == current => ResumeType::RebootPending,
                _ => ResumeType::Reboot,
            },
        }
    }

    fn save_state(&mut self, snapshot: &EngineSnapshot) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        write_atomic(&self.state_path(), &snapshot.encode()?)
    }

    fn load_state(&self) -> Result<Option<EngineSnapshot>> {
        match fs::read(self.state_path()) {
            Ok(blob) => Ok(Some(EngineSnapshot::decode(&blob)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn record(&self) -> Result<Option<RegistrationRecord>> {
        match fs::read(self.record_path()) {
            Ok(json) => Ok(Some(serde_json::from_slice(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write via a sibling temp file and rename, so readers never see a torn file.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
