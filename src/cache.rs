//! Payload cache
//!
//! Before anything executes, payloads of packages that will install or repair
//! are copied from the source (layout) directory into the bundle's cache at
//! `<cache>/<package id>/<file name>`. Rollback and later repair/uninstall
//! runs use the cached copy, never the source, which may be gone by then.

use crate::error::{BurnError, Result};
use crate::package::Package;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PayloadCache {
    source_dir: PathBuf,
    cache_dir: PathBuf,
}

impl PayloadCache {
    pub fn new(source_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    /// Where the payload sits in the source: `<source>/<id>/<file>` if that
    /// exists, else `<source>/<file>`.
    pub fn source_path(&self, package: &Package) -> PathBuf {
        let nested = package.payload_path(&self.source_dir);
        if nested.exists() {
            nested
        } else {
            self.source_dir.join(&package.file_name)
        }
    }

    /// Copy and verify one payload; returns its cached path.
    pub fn cache_package(&self, package: &Package) -> Result<PathBuf> {
        let target = package.payload_path(&self.cache_dir);

        if self.verify(package, &target).is_ok() {
            tracing::debug!("Payload for {} already cached at {}", package.id, target.display());
            return Ok(target);
        }

        let source = self.source_path(package);
        if !source.is_file() {
            return Err(BurnError::cache(format!(
                "payload for package '{}' not found at {}",
                package.id,
                source.display()
            )));
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let partial = target.with_extension("partial");
        fs::copy(&source, &partial)?;
        if let Err(e) = self.verify(package, &partial) {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }
        fs::rename(&partial, &target)?;

        tracing::info!("Cached payload for {} ({})", package.id, target.display());
        Ok(target)
    }

    fn verify(&self, package: &Package, path: &Path) -> Result<()> {
        let metadata = fs::metadata(path)?;
        match package.file_size {
            Some(expected) if metadata.len() != expected => Err(BurnError::cache(format!(
                "payload for package '{}' is {} bytes, expected {}",
                package.id,
                metadata.len(),
                expected
            ))),
            _ => Ok(()),
        }
    }

    /// Drop the whole bundle cache.
    pub fn purge(&self) -> Result<()> {
        remove_dir_if_present(&self.cache_dir)
    }
}

fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use tempfile::TempDir;

    fn package(file_size: Option<u64>) -> Package {
        let xml = format!(
            r#"<BurnManifest>
                 <Registration Id="{{2C5B0B3A-8A4C-4E28-9D4B-55B0C1D2E3F4}}" Name="B" Version="1.0"/>
                 <Chain>
                   <ExePackage Id="Tool" FileName="tool.sh" DetectCondition="ToolPresent"
                               InstallArguments="" {}/>
                 </Chain>
               </BurnManifest>"#,
            file_size
                .map(|s| format!("FileSize=\"{}\"", s))
                .unwrap_or_default()
        );
        Manifest::parse(&xml).unwrap().packages.remove(0)
    }

    #[test]
    fn test_cache_copies_and_verifies() {
        let source = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        fs::write(source.path().join("tool.sh"), b"#!/bin/sh\n").unwrap();

        let cache = PayloadCache::new(source.path(), cache.path());
        let cached = cache.cache_package(&package(Some(10))).unwrap();
        assert_eq!(cached, cache.cache_dir().join("Tool").join("tool.sh"));
        assert_eq!(fs::read(&cached).unwrap(), b"#!/bin/sh\n");
    }

    #[test]
    fn test_size_mismatch_fails() {
        let source = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        fs::write(source.path().join("tool.sh"), b"#!/bin/sh\n").unwrap();

        let cache = PayloadCache::new(source.path(), cache.path());
        let err = cache.cache_package(&package(Some(99))).unwrap_err();
        assert!(matches!(err, BurnError::Cache(_)));
        assert!(!cache.cache_dir().join("Tool").join("tool.sh").exists());
    }

    #[test]
    fn test_missing_payload_fails() {
        let source = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let cache = PayloadCache::new(source.path(), cache.path());
        assert!(matches!(
            cache.cache_package(&package(None)),
            Err(BurnError::Cache(_))
        ));
    }

    #[test]
    fn test_purge() {
        let source = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        fs::write(source.path().join("tool.sh"), b"x").unwrap();

        let cache = PayloadCache::new(source.path(), root.path().join("bundle"));
        cache.cache_package(&package(None)).unwrap();
        cache.purge().unwrap();
        assert!(!root.path().join("bundle").exists());
        cache.purge().unwrap();
    }
}
