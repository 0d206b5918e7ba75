//! Reconciliation state machine.

use color_eyre::{eyre::eyre, Result};

/// Where the offline cache stands in its lifecycle.
///
/// ```text
/// Empty ──install──▶ Staged ──activate──▶ Reconciling ──▶ Live
///   ▲                                          │
///   └────────────── Failed ◀───────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
  /// Nothing cached, or the cache was reset
  Empty,
  /// Shell resources are in the staging partition
  Staged,
  /// Activation is merging staging into live
  Reconciling,
  /// Live partition and stored manifest match the current build
  Live,
  /// Activation failed; always followed by a reset to `Empty`
  Failed,
}

impl ReconcileState {
  pub fn can_transition(self, to: ReconcileState) -> bool {
    use ReconcileState::*;
    matches!(
      (self, to),
      (Empty | Staged | Live, Staged)
        | (Empty | Staged | Live, Reconciling)
        | (Reconciling, Live)
        | (Reconciling, Failed)
        | (Failed, Empty)
    )
  }

  pub fn transition(self, to: ReconcileState) -> Result<ReconcileState> {
    if self.can_transition(to) {
      Ok(to)
    } else {
      Err(eyre!("Invalid cache state transition: {} -> {}", self, to))
    }
  }
}

impl std::fmt::Display for ReconcileState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Empty => "empty",
      Self::Staged => "staged",
      Self::Reconciling => "reconciling",
      Self::Live => "live",
      Self::Failed => "failed",
    };
    f.write_str(s)
  }
}

#[cfg(test)]
mod tests {
  use super::ReconcileState::*;

  #[test]
  fn test_happy_path() {
    let s = Empty.transition(Staged).unwrap();
    let s = s.transition(Reconciling).unwrap();
    assert_eq!(s.transition(Live).unwrap(), Live);
  }

  #[test]
  fn test_failed_only_goes_to_empty() {
    assert!(Failed.can_transition(Empty));
    assert!(!Failed.can_transition(Live));
    assert!(!Failed.can_transition(Staged));
    assert!(!Failed.can_transition(Reconciling));
  }

  #[test]
  fn test_no_reentrant_reconcile() {
    assert!(Reconciling.transition(Reconciling).is_err());
    assert!(Reconciling.transition(Staged).is_err());
  }

  #[test]
  fn test_upgrade_install_from_live() {
    assert!(Live.can_transition(Staged));
    assert!(Live.can_transition(Reconciling));
  }
}
