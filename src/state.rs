//! Resume state blob
//!
//! A snapshot of everything a later run needs to pick up an interrupted
//! session: the bundle action, the persistable variables and each package's
//! detected/planned states plus whether it already ran. Encoded with postcard
//! behind a magic and format version, so a blob from a different engine
//! build is rejected instead of misread.

use crate::error::{BurnError, Result};
use crate::package::Package;
use crate::types::{ActionState, BundleAction, PackageState, RequestState};
use crate::variables::Variant;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const MAGIC: &[u8; 4] = b"BURN";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = MAGIC.len() + 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSnapshot {
    pub id: String,
    pub current: PackageState,
    pub requested: RequestState,
    pub execute: ActionState,
    pub rollback: ActionState,
    /// The package's execute action finished before the session stopped
    pub completed: bool,
}

impl PackageSnapshot {
    pub fn of(package: &Package, completed: bool) -> Self {
        Self {
            id: package.id.clone(),
            current: package.current,
            requested: package.requested,
            execute: package.execute,
            rollback: package.rollback,
            completed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub action: BundleAction,
    pub restart_required: bool,
    /// Persistable variables only (no built-ins, nothing hidden)
    pub variables: BTreeMap<String, Variant>,
    /// Chain order
    pub packages: Vec<PackageSnapshot>,
}

impl EngineSnapshot {
    pub fn package(&self, id: &str) -> Option<&PackageSnapshot> {
        self.packages.iter().find(|p| p.id == id)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut blob = Vec::with_capacity(256);
        blob.extend_from_slice(MAGIC);
        blob.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        blob.extend_from_slice(&postcard::to_stdvec(self)?);
        Ok(blob)
    }

    pub fn decode(blob: &[u8]) -> Result<Self> {
        if blob.len() < HEADER_LEN || &blob[..MAGIC.len()] != MAGIC {
            return Err(BurnError::registration("state blob has no engine header"));
        }
        let version = u16::from_le_bytes([blob[4], blob[5]]);
        if version != FORMAT_VERSION {
            return Err(BurnError::registration(format!(
                "state blob format {} is not supported (expected {})",
                version, FORMAT_VERSION
            )));
        }
        Ok(postcard::from_bytes(&blob[HEADER_LEN..])?)
    }
}
