//! Detect: run the searches, then ask each package engine for its state.
//!
//! A failing search or package never stops detection; the package reads
//! Unknown and the failure travels in its Complete callback. Packages the
//! resumed session already finished are not probed again: their state is the
//! one their completed action left behind.

use super::{CANCELLED, Engine, Operation};
use crate::error::{HResult, Result};
use crate::package::{DetectContext, detect_package};
use crate::types::PackageState;

impl Engine {
    /// Run Detect. `Err` only when the request is rejected.
    pub fn detect(&self) -> Result<HResult> {
        self.begin(Operation::Detect)?;

        let (resume, ids) = {
            let mut state = self.lock()?;
            state.plan.clear();
            for package in &mut state.packages {
                package.reset_state();
            }
            let ids: Vec<String> = state.packages.iter().map(|p| p.id.clone()).collect();
            (state.resume_type, ids)
        };
        tracing::info!("Detecting {} package(s), resume type {}", ids.len(), resume);

        if self.ux.on_detect_begin(resume, ids.len()).is_cancel() {
            tracing::warn!("Detect cancelled by the user experience");
            self.revert(Operation::Detect);
            self.ux.on_detect_complete(CANCELLED);
            return Ok(CANCELLED);
        }

        self.run_searches()?;

        for id in &ids {
            if self.ux.on_detect_package_begin(id).is_cancel() {
                tracing::warn!("Detect cancelled at package {}", id);
                self.revert(Operation::Detect);
                self.ux.on_detect_complete(CANCELLED);
                return Ok(CANCELLED);
            }

            let (status, current) = self.detect_one(id)?;
            self.ux.on_detect_package_complete(id, status, current);
        }

        self.finish(Operation::Detect, true);
        self.ux.on_detect_complete(HResult::S_OK);
        Ok(HResult::S_OK)
    }

    fn run_searches(&self) -> Result<()> {
        let mut state = self.lock()?;
        for search in &self.manifest.searches {
            match search.execute(self.probe.as_ref(), &mut state.variables) {
                Ok(true) => tracing::debug!("Search {} set {}", search.id, search.variable),
                Ok(false) => tracing::debug!("Search {} skipped by its condition", search.id),
                Err(e) => tracing::warn!("Search {} failed: {}", search.id, e),
            }
        }
        Ok(())
    }

    fn detect_one(&self, id: &str) -> Result<(HResult, PackageState)> {
        let mut state = self.lock()?;

        let resumed = state
            .resume_snapshot
            .as_ref()
            .and_then(|snapshot| snapshot.package(id))
            .filter(|p| p.completed)
            .map(|p| p.execute.resulting_state(p.current));

        let (status, current) = match resumed {
            Some(current) => {
                tracing::info!("{} completed before the restart: {}", id, current);
                (HResult::S_OK, current)
            }
            None => {
                let package = state.package(id)?;
                let ctx = DetectContext {
                    probe: self.probe.as_ref(),
                    variables: &state.variables,
                };
                match detect_package(package, &ctx) {
                    Ok(current) => {
                        tracing::info!("Detected {}: {}", id, current);
                        (HResult::S_OK, current)
                    }
                    Err(e) => {
                        tracing::warn!("{}", e);
                        (e.hresult(), PackageState::Unknown)
                    }
                }
            }
        };

        if let Some(package) = state.packages.iter_mut().find(|p| p.id == id) {
            package.current = current;
        }
        Ok((status, current))
    }
}
