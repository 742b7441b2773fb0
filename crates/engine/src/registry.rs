//! Workflow definition registry: the loaded definitions, their admin-driven
//! status and their enrolled/completed counters.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::models::{DefinitionStatus, StepSpec, WorkflowDefinition, WorkflowStep};
use crate::EngineError;

#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    definitions: RwLock<BTreeMap<String, WorkflowDefinition>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, WorkflowDefinition>> {
        self.definitions.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, WorkflowDefinition>> {
        self.definitions.write().unwrap_or_else(|p| p.into_inner())
    }

    /// # Errors
    /// [`EngineError::DuplicateDefinition`] if the id is taken.
    pub fn register(&self, definition: WorkflowDefinition) -> Result<(), EngineError> {
        let mut definitions = self.write();
        if definitions.contains_key(&definition.id) {
            return Err(EngineError::DuplicateDefinition(definition.id));
        }
        definitions.insert(definition.id.clone(), definition);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<WorkflowDefinition> {
        self.read().get(id).cloned()
    }

    pub fn status(&self, id: &str) -> Option<DefinitionStatus> {
        self.read().get(id).map(|d| d.status)
    }

    /// All definitions, ordered by id.
    pub fn list(&self) -> Vec<WorkflowDefinition> {
        self.read().values().cloned().collect()
    }

    /// Move a definition from `expected` to `to`.
    ///
    /// # Errors
    /// - [`EngineError::UnknownDefinition`]
    /// - [`EngineError::DefinitionStatus`] if the current status is not `expected`.
    pub fn transition(
        &self,
        id: &str,
        expected: DefinitionStatus,
        to: DefinitionStatus,
    ) -> Result<(), EngineError> {
        let mut definitions = self.write();
        let definition = definitions
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownDefinition(id.to_owned()))?;
        if definition.status != expected {
            return Err(EngineError::DefinitionStatus {
                id: id.to_owned(),
                actual: definition.status,
                expected,
            });
        }
        definition.status = to;
        Ok(())
    }

    /// Append a step after the current last one. Existing steps never change.
    ///
    /// # Errors
    /// - [`EngineError::UnknownDefinition`]
    /// - [`EngineError::InvalidStep`] if the step does not load, reuses an id,
    ///   or does not sort after the current last step.
    pub fn append_step(&self, id: &str, spec: &StepSpec) -> Result<WorkflowStep, EngineError> {
        let step = WorkflowStep::load(id, spec)?;
        let mut definitions = self.write();
        let definition = definitions
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownDefinition(id.to_owned()))?;

        let invalid = |reason: String| EngineError::InvalidStep {
            definition_id: id.to_owned(),
            step_id: step.id.clone(),
            reason,
        };
        if definition.step(&step.id).is_some() {
            return Err(invalid("duplicate step id".into()));
        }
        if let Some(last) = definition.steps.last() {
            if step.order <= last.order {
                return Err(invalid(format!(
                    "order index {} must follow the last step ({})",
                    step.order, last.order
                )));
            }
        }

        definition.steps.push(step.clone());
        Ok(step)
    }

    pub fn record_enrollment(&self, id: &str) {
        if let Some(definition) = self.write().get_mut(id) {
            definition.enrolled_count += 1;
        }
    }

    pub fn record_completion(&self, id: &str) {
        if let Some(definition) = self.write().get_mut(id) {
            definition.completed_count += 1;
        }
    }
}
