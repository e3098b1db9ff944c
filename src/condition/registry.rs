use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use error_stack::{Report, bail};

use crate::condition::evaluator::{ConditionEvaluator, Evaluation, RuntimeState};
use crate::condition::{Condition, ConditionStatus};
use crate::error::RegistryError;
use crate::model::{ConditionId, ConditionResult};

struct Entry {
    condition: Condition,
    state: RuntimeState,
    /// Status to restore if an in-flight pass is aborted.
    status_before_pass: ConditionStatus,
}

/// A condition picked up by an evaluation pass, with its runtime state.
#[derive(Debug, Clone)]
pub struct PassItem {
    pub condition: Condition,
    pub state: RuntimeState,
}

/// Per-condition outcome handed back to the registry at the end of a pass.
#[derive(Debug)]
pub enum PassOutcome {
    Evaluated(Evaluation),
    Failed { id: ConditionId, error: String },
}

/// Owns every condition definition and its runtime state.
///
/// All access goes through one `RwLock`, so mutations from the API layer are
/// serialized relative to the snapshot and commit steps of a pass. Unknown ids
/// passed to [`unregister`](Self::unregister) or [`set_active`](Self::set_active)
/// are reported as [`RegistryError::NotFound`].
#[derive(Default)]
pub struct ConditionRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl ConditionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a condition. Runtime fields are reset; the status is `idle`
    /// for active conditions and `disabled` otherwise.
    pub fn register(&self, mut condition: Condition) -> Result<ConditionId, Report<RegistryError>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.iter().any(|e| e.condition.id() == condition.id()) {
            bail!(RegistryError::DuplicateCondition {
                id: condition.id().to_string(),
            });
        }

        condition.status = if condition.is_active {
            ConditionStatus::Idle
        } else {
            ConditionStatus::Disabled
        };
        condition.trigger_count = 0;
        condition.evaluation_count = 0;
        condition.last_triggered = None;
        condition.next_evaluation = None;
        condition.last_error = None;

        let id = condition.id().clone();
        tracing::debug!(condition_id = %id, rule = %condition.describe(), "condition registered");
        entries.push(Entry {
            status_before_pass: condition.status,
            condition,
            state: RuntimeState::default(),
        });
        Ok(id)
    }

    pub fn unregister(&self, id: &ConditionId) -> Result<Condition, Report<RegistryError>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let Some(index) = entries.iter().position(|e| e.condition.id() == id) else {
            bail!(RegistryError::NotFound { id: id.to_string() });
        };
        tracing::debug!(condition_id = %id, "condition unregistered");
        Ok(entries.remove(index).condition)
    }

    pub fn get(&self, id: &ConditionId) -> Option<Condition> {
        self.read(|entries| {
            entries
                .iter()
                .find(|e| e.condition.id() == id)
                .map(|e| e.condition.clone())
        })
    }

    /// Point-in-time copy of the active conditions, in registration order.
    pub fn list_active(&self) -> Vec<Condition> {
        self.read(|entries| {
            entries
                .iter()
                .filter(|e| e.condition.is_active)
                .map(|e| e.condition.clone())
                .collect()
        })
    }

    pub fn list_all(&self) -> Vec<Condition> {
        self.read(|entries| entries.iter().map(|e| e.condition.clone()).collect())
    }

    pub fn len(&self) -> usize {
        self.read(Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Activate or deactivate a condition. Deactivation moves it to
    /// `disabled` from any state; reactivation returns it to `idle`.
    pub fn set_active(&self, id: &ConditionId, active: bool) -> Result<(), Report<RegistryError>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = entries.iter_mut().find(|e| e.condition.id() == id) else {
            bail!(RegistryError::NotFound { id: id.to_string() });
        };
        if entry.condition.is_active == active {
            return Ok(());
        }
        entry.condition.is_active = active;
        entry.condition.status = if active {
            ConditionStatus::Idle
        } else {
            ConditionStatus::Disabled
        };
        tracing::info!(condition_id = %id, active, "condition activation changed");
        Ok(())
    }

    /// Snapshot the active conditions for `symbol` and mark them `evaluating`.
    pub(crate) fn begin_pass(&self, symbol: &str) -> Vec<PassItem> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter_mut()
            .filter(|e| ConditionEvaluator::applies_to(&e.condition, symbol))
            .map(|e| {
                e.status_before_pass = e.condition.status;
                e.condition.status = ConditionStatus::Evaluating;
                PassItem {
                    condition: e.condition.clone(),
                    state: e.state.clone(),
                }
            })
            .collect()
    }

    /// Apply the outcomes of a pass. Returns the results that were committed,
    /// in the order given; conditions removed or disabled while the pass was
    /// in flight are skipped.
    pub(crate) fn commit_pass(
        &self,
        outcomes: Vec<PassOutcome>,
        now: DateTime<Utc>,
        next_evaluation: Option<DateTime<Utc>>,
    ) -> Vec<(Condition, ConditionResult)> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut committed = Vec::new();

        for outcome in outcomes {
            let id = match &outcome {
                PassOutcome::Evaluated(eval) => &eval.result.condition_id,
                PassOutcome::Failed { id, .. } => id,
            };
            let Some(entry) = entries
                .iter_mut()
                .find(|e| e.condition.id() == id && e.condition.is_active)
            else {
                continue;
            };

            let condition = &mut entry.condition;
            condition.next_evaluation = next_evaluation;
            match outcome {
                PassOutcome::Evaluated(eval) => {
                    condition.evaluation_count += 1;
                    condition.last_error = None;
                    if eval.result.satisfied {
                        condition.trigger_count += 1;
                        condition.last_triggered = Some(now);
                        condition.status = ConditionStatus::Triggered;
                    } else {
                        condition.status = ConditionStatus::Idle;
                    }
                    entry.state = eval.state;
                    committed.push((condition.clone(), eval.result));
                }
                PassOutcome::Failed { error, .. } => {
                    condition.status = ConditionStatus::Error;
                    condition.last_error = Some(error);
                }
            }
        }
        committed
    }

    /// Undo `begin_pass` for conditions still marked `evaluating`.
    pub(crate) fn abort_pass(&self, ids: &[ConditionId]) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for entry in entries.iter_mut().filter(|e| ids.contains(e.condition.id())) {
            if entry.condition.status == ConditionStatus::Evaluating {
                entry.condition.status = entry.status_before_pass;
            }
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Vec<Entry>) -> T) -> T {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        f(&entries)
    }
}
