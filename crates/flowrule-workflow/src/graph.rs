//! Immutable-by-convention snapshot of one project's workflow.
//!
//! The store never mutates a published graph. Edits clone the current graph,
//! apply the change, bump `version`, and publish the clone, so a reader
//! holding an `Arc<WorkflowGraph>` sees one consistent rule set for as long as
//! it keeps the snapshot.

use crate::history::WorkflowChangeKind;
use crate::state::State;
use crate::{Result, WorkflowError};
use chrono::{DateTime, Utc};
use flowrule_core::{Principal, ProjectId, StateId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// A directed edge `from_state -> to_state` and who may traverse it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRule {
    pub project_id: ProjectId,
    pub from_state: StateId,
    pub to_state: StateId,
    pub movers: BTreeSet<Principal>,
    pub created_at: DateTime<Utc>,
}

impl TransitionRule {
    pub fn is_mover(&self, actor: &Principal) -> bool {
        self.movers.contains(actor)
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    project_id: ProjectId,
    version: u64,
    workflow_enabled: bool,
    states: HashMap<StateId, State>,
    rules: HashMap<(StateId, StateId), TransitionRule>,
}

impl WorkflowGraph {
    pub fn new(project_id: ProjectId) -> Self {
        Self {
            project_id,
            version: 1,
            workflow_enabled: false,
            states: HashMap::new(),
            rules: HashMap::new(),
        }
    }

    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_workflow_enabled(&self) -> bool {
        self.workflow_enabled
    }

    pub fn state(&self, state_id: StateId) -> Option<&State> {
        self.states.get(&state_id)
    }

    /// States ordered by their position in the project.
    pub fn states(&self) -> Vec<&State> {
        let mut states: Vec<_> = self.states.values().collect();
        states.sort_by_key(|s| s.sequence);
        states
    }

    pub fn default_state(&self) -> Option<&State> {
        self.states.values().find(|s| s.is_default)
    }

    pub fn rule(&self, from: StateId, to: StateId) -> Option<&TransitionRule> {
        self.rules.get(&(from, to))
    }

    /// All rules, ordered by source state then target state position.
    pub fn transitions(&self) -> Vec<&TransitionRule> {
        let position = |id: &StateId| self.states.get(id).map(|s| s.sequence).unwrap_or(u32::MAX);
        let mut rules: Vec<_> = self.rules.values().collect();
        rules.sort_by_key(|r| (position(&r.from_state), position(&r.to_state)));
        rules
    }

    /// Rules leaving `from`.
    pub fn transitions_from(&self, from: StateId) -> Vec<&TransitionRule> {
        self.transitions()
            .into_iter()
            .filter(|r| r.from_state == from)
            .collect()
    }

    pub(crate) fn bump_version(&mut self) {
        self.version += 1;
    }

    fn require_state(&self, state_id: StateId) -> Result<&State> {
        self.states
            .get(&state_id)
            .ok_or(WorkflowError::StateNotFound(state_id))
    }

    pub(crate) fn set_workflow_enabled(&mut self, enabled: bool) -> WorkflowChangeKind {
        self.workflow_enabled = enabled;
        if enabled {
            WorkflowChangeKind::WorkflowEnabled
        } else {
            WorkflowChangeKind::WorkflowDisabled
        }
    }

    /// Insert a state. The first state of a project becomes its default.
    pub(crate) fn add_state(&mut self, mut state: State) -> Result<WorkflowChangeKind> {
        if state.project_id != self.project_id {
            return Err(WorkflowError::Validation(format!(
                "state {} belongs to another project",
                state.id
            )));
        }
        if self.states.contains_key(&state.id) {
            return Err(WorkflowError::Validation(format!(
                "state {} already exists",
                state.id
            )));
        }
        if self
            .states
            .values()
            .any(|s| s.name.eq_ignore_ascii_case(&state.name))
        {
            return Err(WorkflowError::Validation(format!(
                "a state named '{}' already exists",
                state.name
            )));
        }

        state.sequence = self
            .states
            .values()
            .map(|s| s.sequence + 1)
            .max()
            .unwrap_or(0);
        if self.states.is_empty() {
            state.is_default = true;
        }
        if state.is_default {
            for existing in self.states.values_mut() {
                existing.is_default = false;
            }
            state.allow_issue_creation = true;
        }

        let kind = WorkflowChangeKind::StateAdded { state_id: state.id };
        self.states.insert(state.id, state);
        Ok(kind)
    }

    pub(crate) fn set_default_state(&mut self, state_id: StateId) -> Result<WorkflowChangeKind> {
        self.require_state(state_id)?;
        for state in self.states.values_mut() {
            state.is_default = state.id == state_id;
            if state.is_default {
                state.allow_issue_creation = true;
            }
        }
        Ok(WorkflowChangeKind::DefaultStateChanged { state_id })
    }

    pub(crate) fn set_creation_allowed(
        &mut self,
        state_id: StateId,
        allowed: bool,
    ) -> Result<WorkflowChangeKind> {
        let state = self
            .states
            .get_mut(&state_id)
            .ok_or(WorkflowError::StateNotFound(state_id))?;
        if state.is_default && !allowed {
            return Err(WorkflowError::Validation(
                "work item creation cannot be disabled for the default state".to_string(),
            ));
        }
        state.allow_issue_creation = allowed;

        Ok(if allowed {
            WorkflowChangeKind::CreationAllowed { state_id }
        } else {
            WorkflowChangeKind::CreationDisallowed { state_id }
        })
    }

    pub(crate) fn add_transition(
        &mut self,
        from: StateId,
        to: StateId,
        movers: BTreeSet<Principal>,
    ) -> Result<WorkflowChangeKind> {
        self.require_state(from)?;
        self.require_state(to)?;
        if from == to {
            return Err(WorkflowError::Validation(
                "a state cannot transition to itself".to_string(),
            ));
        }
        if self.rules.contains_key(&(from, to)) {
            return Err(WorkflowError::Validation(format!(
                "transition {} -> {} already exists",
                from, to
            )));
        }

        self.rules.insert(
            (from, to),
            TransitionRule {
                project_id: self.project_id,
                from_state: from,
                to_state: to,
                movers,
                created_at: Utc::now(),
            },
        );
        Ok(WorkflowChangeKind::TransitionAdded { from, to })
    }

    pub(crate) fn remove_transition(
        &mut self,
        from: StateId,
        to: StateId,
    ) -> Result<WorkflowChangeKind> {
        self.rules.remove(&(from, to)).ok_or_else(|| {
            WorkflowError::Validation(format!("transition {} -> {} does not exist", from, to))
        })?;
        Ok(WorkflowChangeKind::TransitionRemoved { from, to })
    }

    pub(crate) fn add_mover(
        &mut self,
        from: StateId,
        to: StateId,
        mover: Principal,
    ) -> Result<WorkflowChangeKind> {
        let rule = self.rules.get_mut(&(from, to)).ok_or_else(|| {
            WorkflowError::Validation(format!("transition {} -> {} does not exist", from, to))
        })?;
        if !rule.movers.insert(mover.clone()) {
            return Err(WorkflowError::Validation(format!(
                "{} is already a mover for {} -> {}",
                mover, from, to
            )));
        }
        Ok(WorkflowChangeKind::MoverAdded { from, to, mover })
    }

    pub(crate) fn remove_mover(
        &mut self,
        from: StateId,
        to: StateId,
        mover: Principal,
    ) -> Result<WorkflowChangeKind> {
        let rule = self.rules.get_mut(&(from, to)).ok_or_else(|| {
            WorkflowError::Validation(format!("transition {} -> {} does not exist", from, to))
        })?;
        if !rule.movers.remove(&mover) {
            return Err(WorkflowError::Validation(format!(
                "{} is not a mover for {} -> {}",
                mover, from, to
            )));
        }
        Ok(WorkflowChangeKind::MoverRemoved { from, to, mover })
    }

    /// Drop every rule and re-open creation in every state.
    pub(crate) fn reset(&mut self) -> WorkflowChangeKind {
        self.rules.clear();
        for state in self.states.values_mut() {
            state.allow_issue_creation = true;
        }
        WorkflowChangeKind::WorkflowReset
    }
}
