//! Provisioning state machine.
//!
//! `Start -> InstallerSelected -> BaseInstalled -> PathConfigured ->
//! ManagerConfigured -> EnvironmentCreated -> Activated ->
//! (AdditionalPackageInstalled)* -> CachesPruned -> TestInvoked -> End`

use crate::error::ProvisionError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    Start,
    InstallerSelected,
    BaseInstalled,
    PathConfigured,
    ManagerConfigured,
    EnvironmentCreated,
    Activated,
    AdditionalPackageInstalled,
    CachesPruned,
    TestInvoked,
    End,
}

impl ProvisionState {
    pub fn name(&self) -> &'static str {
        match self {
            ProvisionState::Start => "start",
            ProvisionState::InstallerSelected => "installer_selected",
            ProvisionState::BaseInstalled => "base_installed",
            ProvisionState::PathConfigured => "path_configured",
            ProvisionState::ManagerConfigured => "manager_configured",
            ProvisionState::EnvironmentCreated => "environment_created",
            ProvisionState::Activated => "activated",
            ProvisionState::AdditionalPackageInstalled => "additional_package_installed",
            ProvisionState::CachesPruned => "caches_pruned",
            ProvisionState::TestInvoked => "test_invoked",
            ProvisionState::End => "end",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(&self, next: ProvisionState) -> bool {
        use ProvisionState::*;
        matches!(
            (*self, next),
            (Start, InstallerSelected)
                | (InstallerSelected, BaseInstalled)
                | (BaseInstalled, PathConfigured)
                | (PathConfigured, ManagerConfigured)
                | (ManagerConfigured, EnvironmentCreated)
                | (EnvironmentCreated, Activated)
                | (Activated, AdditionalPackageInstalled)
                | (AdditionalPackageInstalled, AdditionalPackageInstalled)
                | (Activated, CachesPruned)
                | (AdditionalPackageInstalled, CachesPruned)
                | (CachesPruned, TestInvoked)
                | (TestInvoked, End)
        )
    }

    /// Move to `next`, rejecting anything off the linear chain.
    pub fn advance(&mut self, next: ProvisionState) -> Result<()> {
        if !self.can_advance_to(next) {
            return Err(ProvisionError::InvalidTransition {
                from: self.name().to_string(),
                to: next.name().to_string(),
            });
        }
        *self = next;
        Ok(())
    }

    /// Whether an environment exists that a failure must roll back.
    pub fn has_environment(&self) -> bool {
        use ProvisionState::*;
        matches!(
            self,
            EnvironmentCreated | Activated | AdditionalPackageInstalled | CachesPruned
        )
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProvisionState::*;

    #[test]
    fn test_full_chain_with_repeated_installs() {
        let mut state = Start;
        for next in [
            InstallerSelected,
            BaseInstalled,
            PathConfigured,
            ManagerConfigured,
            EnvironmentCreated,
            Activated,
            AdditionalPackageInstalled,
            AdditionalPackageInstalled,
            CachesPruned,
            TestInvoked,
            End,
        ] {
            state.advance(next).unwrap();
        }
        assert_eq!(state, End);
    }

    #[test]
    fn test_additional_installs_are_optional() {
        let mut state = Activated;
        state.advance(CachesPruned).unwrap();
        assert_eq!(state, CachesPruned);
    }

    #[test]
    fn test_skipping_a_step_is_rejected() {
        let mut state = Start;
        let err = state.advance(BaseInstalled).unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidTransition { .. }));
        assert_eq!(state, Start);

        let mut state = ManagerConfigured;
        assert!(state.advance(TestInvoked).is_err());
    }

    #[test]
    fn test_no_going_back() {
        let mut state = Activated;
        assert!(state.advance(EnvironmentCreated).is_err());
        let mut state = End;
        assert!(state.advance(Start).is_err());
    }

    #[test]
    fn test_has_environment() {
        assert!(!ManagerConfigured.has_environment());
        assert!(EnvironmentCreated.has_environment());
        assert!(CachesPruned.has_environment());
        assert!(!TestInvoked.has_environment());
    }
}
