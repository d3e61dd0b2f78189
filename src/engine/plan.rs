//! Plan: requested states, the per-package table and execution order.

use super::{CANCELLED, Engine, Operation};
use crate::condition;
use crate::error::{BurnError, HResult, Result};
use crate::package::{Package, plan_package};
use crate::types::{ActionState, BundleAction, RequestState};
use crate::ux::PlannedPackage;
use crate::variables::{Variables, Variant, builtin};

/// One step of the execute plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAction {
    pub package_id: String,
    pub execute: ActionState,
    pub rollback: ActionState,
}

/// Order the chain for execution: uninstalls first in reverse chain order,
/// then installs and repairs in chain order. Packages with nothing to do are
/// left out.
pub fn order_plan(packages: &[Package]) -> Vec<PlannedAction> {
    let step = |p: &Package| PlannedAction {
        package_id: p.id.clone(),
        execute: p.execute,
        rollback: p.rollback,
    };

    let uninstalls = packages
        .iter()
        .rev()
        .filter(|p| p.execute == ActionState::Uninstall)
        .map(step);
    let installs = packages
        .iter()
        .filter(|p| matches!(p.execute, ActionState::Install | ActionState::Repair))
        .map(step);

    uninstalls.chain(installs).collect()
}

/// The request the engine proposes before the UX has its say.
fn default_request(package: &Package, action: BundleAction, vars: &Variables) -> Result<RequestState> {
    let request = action.default_request();
    if !matches!(
        action,
        BundleAction::Install | BundleAction::Modify | BundleAction::Repair
    ) {
        return Ok(request);
    }
    match &package.install_condition {
        Some(cond) if !condition::evaluate(cond, vars)? => {
            tracing::info!(
                "InstallCondition of {} is false; requesting Absent",
                package.id
            );
            Ok(RequestState::Absent)
        }
        _ => Ok(request),
    }
}

impl Engine {
    /// Run Plan for `action`. `Err` only when the request is rejected; plan
    /// failures come back as a failure status.
    pub fn plan(&self, action: BundleAction) -> Result<HResult> {
        self.begin(Operation::Plan)?;

        let ids: Vec<String> = {
            let mut state = self.lock()?;
            state.action = action;
            state
                .variables
                .set_builtin(builtin::BUNDLE_ACTION, Variant::Numeric(action.code()));
            state.plan.clear();
            for package in &mut state.packages {
                package.reset_plan();
            }
            state.packages.iter().map(|p| p.id.clone()).collect()
        };
        tracing::info!("Planning {} for {} package(s)", action, ids.len());

        if self.ux.on_plan_begin(ids.len()).is_cancel() {
            tracing::warn!("Plan cancelled by the user experience");
            self.revert(Operation::Plan);
            self.ux.on_plan_complete(CANCELLED);
            return Ok(CANCELLED);
        }

        for id in &ids {
            match self.plan_one(id, action) {
                Ok(()) => {}
                Err(PlanStop::Cancelled) => {
                    tracing::warn!("Plan cancelled at package {}", id);
                    self.discard_plan();
                    self.revert(Operation::Plan);
                    self.ux.on_plan_complete(CANCELLED);
                    return Ok(CANCELLED);
                }
                Err(PlanStop::Failed(e)) => {
                    tracing::error!("{}", e);
                    let status = e.hresult();
                    self.discard_plan();
                    self.finish(Operation::Plan, false);
                    self.ux.on_plan_complete(status);
                    return Ok(status);
                }
            }
        }

        {
            let mut state = self.lock()?;
            state.plan = order_plan(&state.packages);
            for step in &state.plan {
                tracing::info!(
                    "Plan: {} {} (rollback {})",
                    step.execute,
                    step.package_id,
                    step.rollback
                );
            }
        }
        self.finish(Operation::Plan, true);
        self.ux.on_plan_complete(HResult::S_OK);
        Ok(HResult::S_OK)
    }

    fn plan_one(&self, id: &str, action: BundleAction) -> std::result::Result<(), PlanStop> {
        let mut requested = {
            let state = self.lock()?;
            default_request(state.package(id)?, action, &state.variables)?
        };

        if self.ux.on_plan_package_begin(id, &mut requested).is_cancel() {
            return Err(PlanStop::Cancelled);
        }

        let planned = {
            let mut state = self.lock()?;
            let package = state
                .packages
                .iter_mut()
                .find(|p| p.id == id)
                .ok_or_else(|| BurnError::state(format!("no package '{}' in the chain", id)))?;
            let (execute, rollback) = plan_package(package, requested)?;
            package.requested = requested;
            package.execute = execute;
            package.rollback = rollback;
            PlannedPackage {
                current: package.current,
                requested,
                execute,
                rollback,
            }
        };

        self.ux
            .on_plan_package_complete(id, HResult::S_OK, &planned);
        Ok(())
    }

    /// Forget a partial plan so Apply can never see it.
    fn discard_plan(&self) {
        if let Ok(mut state) = self.lock() {
            state.plan.clear();
            for package in &mut state.packages {
                package.reset_plan();
            }
        }
    }
}

enum PlanStop {
    Cancelled,
    Failed(BurnError),
}

impl From<BurnError> for PlanStop {
    fn from(err: BurnError) -> Self {
        Self::Failed(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use crate::types::PackageState;
    use proptest::prelude::*;

    fn chain(states: &[(PackageState, RequestState)]) -> Vec<Package> {
        let mut xml = String::from(
            r#"<BurnManifest><Registration Id="{2C5B0B3A-8A4C-4E28-9D4B-55B0C1D2E3F4}" Name="B" Version="1.0"/><Chain>"#,
        );
        for i in 0..states.len() {
            xml.push_str(&format!(
                r#"<ExePackage Id="P{i}" FileName="p{i}.sh" DetectCondition="P{i}Present"
                               InstallArguments="-i" RepairArguments="-r" UninstallArguments="-u"/>"#
            ));
        }
        xml.push_str("</Chain></BurnManifest>");

        let mut packages = Manifest::parse(&xml).unwrap().packages;
        for (package, (current, requested)) in packages.iter_mut().zip(states) {
            package.current = *current;
            let (execute, rollback) = plan_package(package, *requested).unwrap();
            package.requested = *requested;
            package.execute = execute;
            package.rollback = rollback;
        }
        packages
    }

    #[test]
    fn test_uninstalls_run_first_in_reverse() {
        use PackageState::*;
        use RequestState as R;
        let packages = chain(&[
            (Present, R::Absent),
            (Absent, R::Present),
            (Present, R::Absent),
            (Present, R::Repair),
            (Absent, R::Absent),
        ]);
        let order: Vec<(String, ActionState)> = order_plan(&packages)
            .into_iter()
            .map(|s| (s.package_id, s.execute))
            .collect();
        assert_eq!(
            order,
            vec![
                ("P2".to_string(), ActionState::Uninstall),
                ("P0".to_string(), ActionState::Uninstall),
                ("P1".to_string(), ActionState::Install),
                ("P3".to_string(), ActionState::Repair),
            ]
        );
    }

    fn state_strategy() -> impl Strategy<Value = (PackageState, RequestState)> {
        let current = prop_oneof![
            Just(PackageState::Absent),
            Just(PackageState::Present),
            Just(PackageState::Superseded),
            Just(PackageState::Obsolete),
        ];
        let requested = prop_oneof![
            Just(RequestState::None),
            Just(RequestState::Absent),
            Just(RequestState::Present),
            Just(RequestState::Repair),
        ];
        (current, requested)
    }

    proptest! {
        #[test]
        fn prop_plan_order(states in prop::collection::vec(state_strategy(), 0..12)) {
            let packages = chain(&states);
            let plan = order_plan(&packages);
            let index = |id: &str| packages.iter().position(|p| p.id == id).unwrap();

            // Every package with an action appears exactly once
            let active = packages.iter().filter(|p| !p.execute.is_none()).count();
            prop_assert_eq!(plan.len(), active);

            // Uninstalls precede everything else
            let first_other = plan
                .iter()
                .position(|s| s.execute != ActionState::Uninstall)
                .unwrap_or(plan.len());
            prop_assert!(plan[first_other..].iter().all(|s| s.execute != ActionState::Uninstall));

            // Uninstalls in reverse chain order, the rest in chain order
            let uninstall_idx: Vec<usize> = plan[..first_other].iter().map(|s| index(&s.package_id)).collect();
            prop_assert!(uninstall_idx.windows(2).all(|w| w[0] > w[1]));
            let install_idx: Vec<usize> = plan[first_other..].iter().map(|s| index(&s.package_id)).collect();
            prop_assert!(install_idx.windows(2).all(|w| w[0] < w[1]));
        }

        #[test]
        fn prop_execute_matches_current_state(states in prop::collection::vec(state_strategy(), 1..8)) {
            for package in chain(&states) {
                match package.execute {
                    ActionState::Install => prop_assert_ne!(package.current, PackageState::Present),
                    ActionState::Uninstall | ActionState::Repair => {
                        prop_assert_eq!(package.current, PackageState::Present)
                    }
                    ActionState::None => {}
                }
            }
        }
    }
}
