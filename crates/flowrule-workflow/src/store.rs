//! State graph persistence and the edit API.

use crate::graph::{TransitionRule, WorkflowGraph};
use crate::history::{WorkflowChange, WorkflowChangeKind};
use crate::state::State;
use crate::{Result, WorkflowError};
use async_trait::async_trait;
use flowrule_core::{Principal, ProjectId, StateId};
use flowrule_infra::{KeyedLock, VersionedCache};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Persistence for project workflow graphs and their change history.
#[async_trait]
pub trait StateGraphRepository: Send + Sync {
    /// Load the current graph of a project.
    async fn load(&self, project_id: ProjectId) -> Result<Option<Arc<WorkflowGraph>>>;

    /// Version of the current graph, without loading it.
    async fn current_version(&self, project_id: ProjectId) -> Result<Option<u64>>;

    /// Replace the project's graph.
    async fn save(&self, graph: Arc<WorkflowGraph>) -> Result<()>;

    async fn append_change(&self, change: WorkflowChange) -> Result<()>;

    /// Changes for a project, oldest first.
    async fn list_changes(&self, project_id: ProjectId) -> Result<Vec<WorkflowChange>>;
}

/// In-memory graph repository
pub struct InMemoryStateGraphRepository {
    graphs: RwLock<HashMap<ProjectId, Arc<WorkflowGraph>>>,
    changes: RwLock<HashMap<ProjectId, Vec<WorkflowChange>>>,
}

impl InMemoryStateGraphRepository {
    pub fn new() -> Self {
        Self {
            graphs: RwLock::new(HashMap::new()),
            changes: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStateGraphRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateGraphRepository for InMemoryStateGraphRepository {
    async fn load(&self, project_id: ProjectId) -> Result<Option<Arc<WorkflowGraph>>> {
        let graphs = self.graphs.read().await;
        Ok(graphs.get(&project_id).cloned())
    }

    async fn current_version(&self, project_id: ProjectId) -> Result<Option<u64>> {
        let graphs = self.graphs.read().await;
        Ok(graphs.get(&project_id).map(|g| g.version()))
    }

    async fn save(&self, graph: Arc<WorkflowGraph>) -> Result<()> {
        let mut graphs = self.graphs.write().await;
        graphs.insert(graph.project_id(), graph);
        Ok(())
    }

    async fn append_change(&self, change: WorkflowChange) -> Result<()> {
        let mut changes = self.changes.write().await;
        changes.entry(change.project_id).or_default().push(change);
        Ok(())
    }

    async fn list_changes(&self, project_id: ProjectId) -> Result<Vec<WorkflowChange>> {
        let changes = self.changes.read().await;
        Ok(changes.get(&project_id).cloned().unwrap_or_default())
    }
}

/// Read-mostly access to project workflow graphs.
///
/// Reads return a shared snapshot cached by `(project, version)`. Writes are
/// serialized per project; each one publishes a new graph with a higher
/// version and records a [`WorkflowChange`].
pub struct StateGraphStore {
    repository: Arc<dyn StateGraphRepository>,
    cache: VersionedCache<ProjectId, WorkflowGraph>,
    write_locks: KeyedLock<ProjectId>,
}

impl StateGraphStore {
    pub fn new(repository: Arc<dyn StateGraphRepository>) -> Self {
        Self {
            repository,
            cache: VersionedCache::new(),
            write_locks: KeyedLock::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStateGraphRepository::new()))
    }

    /// Register a project with an empty graph and the workflow disabled.
    pub async fn create_project(&self, project_id: ProjectId) -> Result<Arc<WorkflowGraph>> {
        let _guard = self.write_locks.lock(project_id).await;
        if self.repository.current_version(project_id).await?.is_some() {
            return Err(WorkflowError::Validation(format!(
                "project {} already has a workflow",
                project_id
            )));
        }

        let graph = Arc::new(WorkflowGraph::new(project_id));
        self.repository.save(Arc::clone(&graph)).await?;
        info!(project_id = %project_id, "Registered project workflow");
        Ok(graph)
    }

    /// Current graph of a project.
    pub async fn snapshot(&self, project_id: ProjectId) -> Result<Arc<WorkflowGraph>> {
        let version = self
            .repository
            .current_version(project_id)
            .await?
            .ok_or(WorkflowError::ProjectNotFound(project_id))?;

        if let Some(graph) = self.cache.get(&project_id, version) {
            return Ok(graph);
        }

        let graph = self
            .repository
            .load(project_id)
            .await?
            .ok_or(WorkflowError::ProjectNotFound(project_id))?;
        debug!(project_id = %project_id, version = graph.version(), "Loaded workflow graph");
        Ok(self.cache.insert_shared(project_id, graph.version(), graph))
    }

    pub async fn list_transitions(&self, project_id: ProjectId) -> Result<Vec<TransitionRule>> {
        let graph = self.snapshot(project_id).await?;
        Ok(graph.transitions().into_iter().cloned().collect())
    }

    pub async fn list_states(&self, project_id: ProjectId) -> Result<Vec<State>> {
        let graph = self.snapshot(project_id).await?;
        Ok(graph.states().into_iter().cloned().collect())
    }

    pub async fn change_history(&self, project_id: ProjectId) -> Result<Vec<WorkflowChange>> {
        // Surface unknown projects instead of an empty history.
        self.snapshot(project_id).await?;
        self.repository.list_changes(project_id).await
    }

    pub async fn set_workflow_enabled(
        &self,
        project_id: ProjectId,
        enabled: bool,
        actor: &Principal,
    ) -> Result<Arc<WorkflowGraph>> {
        self.edit(project_id, actor, move |graph| {
            Ok(graph.set_workflow_enabled(enabled))
        })
        .await
    }

    pub async fn add_state(
        &self,
        state: State,
        actor: &Principal,
    ) -> Result<Arc<WorkflowGraph>> {
        let project_id = state.project_id;
        self.edit(project_id, actor, move |graph| graph.add_state(state))
            .await
    }

    pub async fn set_default_state(
        &self,
        project_id: ProjectId,
        state_id: StateId,
        actor: &Principal,
    ) -> Result<Arc<WorkflowGraph>> {
        self.edit(project_id, actor, move |graph| graph.set_default_state(state_id))
            .await
    }

    pub async fn set_creation_allowed(
        &self,
        project_id: ProjectId,
        state_id: StateId,
        allowed: bool,
        actor: &Principal,
    ) -> Result<Arc<WorkflowGraph>> {
        self.edit(project_id, actor, move |graph| {
            graph.set_creation_allowed(state_id, allowed)
        })
        .await
    }

    pub async fn add_transition(
        &self,
        project_id: ProjectId,
        from: StateId,
        to: StateId,
        movers: impl IntoIterator<Item = Principal>,
        actor: &Principal,
    ) -> Result<Arc<WorkflowGraph>> {
        let movers: BTreeSet<Principal> = movers.into_iter().collect();
        self.edit(project_id, actor, move |graph| {
            graph.add_transition(from, to, movers)
        })
        .await
    }

    pub async fn remove_transition(
        &self,
        project_id: ProjectId,
        from: StateId,
        to: StateId,
        actor: &Principal,
    ) -> Result<Arc<WorkflowGraph>> {
        self.edit(project_id, actor, move |graph| graph.remove_transition(from, to))
            .await
    }

    pub async fn add_mover(
        &self,
        project_id: ProjectId,
        from: StateId,
        to: StateId,
        mover: Principal,
        actor: &Principal,
    ) -> Result<Arc<WorkflowGraph>> {
        self.edit(project_id, actor, move |graph| graph.add_mover(from, to, mover))
            .await
    }

    pub async fn remove_mover(
        &self,
        project_id: ProjectId,
        from: StateId,
        to: StateId,
        mover: Principal,
        actor: &Principal,
    ) -> Result<Arc<WorkflowGraph>> {
        self.edit(project_id, actor, move |graph| graph.remove_mover(from, to, mover))
            .await
    }

    /// Delete every transition rule of the project in one step.
    pub async fn reset_workflow(
        &self,
        project_id: ProjectId,
        actor: &Principal,
    ) -> Result<Arc<WorkflowGraph>> {
        self.edit(project_id, actor, |graph| Ok(graph.reset())).await
    }

    async fn edit<F>(
        &self,
        project_id: ProjectId,
        actor: &Principal,
        apply: F,
    ) -> Result<Arc<WorkflowGraph>>
    where
        F: FnOnce(&mut WorkflowGraph) -> Result<WorkflowChangeKind> + Send,
    {
        let _guard = self.write_locks.lock(project_id).await;

        let current = self
            .repository
            .load(project_id)
            .await?
            .ok_or(WorkflowError::ProjectNotFound(project_id))?;

        let mut next = (*current).clone();
        let kind = apply(&mut next)?;
        next.bump_version();
        let next = Arc::new(next);

        self.repository.save(Arc::clone(&next)).await?;
        self.cache.evict(&project_id);
        self.cache
            .insert_shared(project_id, next.version(), Arc::clone(&next));

        info!(
            project_id = %project_id,
            actor = %actor,
            version = next.version(),
            change = ?kind,
            "Workflow updated"
        );

        self.repository
            .append_change(WorkflowChange::new(
                project_id,
                actor.clone(),
                kind,
                next.version(),
            ))
            .await?;

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_states(names: &[&str]) -> (StateGraphStore, ProjectId, Vec<StateId>) {
        let store = StateGraphStore::in_memory();
        let project = ProjectId::new();
        store.create_project(project).await.unwrap();

        let mut ids = Vec::new();
        for name in names {
            let state = State::new(project, *name);
            ids.push(state.id);
            store.add_state(state, &"admin".into()).await.unwrap();
        }
        (store, project, ids)
    }

    #[tokio::test]
    async fn test_unknown_project() {
        let store = StateGraphStore::in_memory();
        let err = store.snapshot(ProjectId::new()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ProjectNotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_project_rejected() {
        let store = StateGraphStore::in_memory();
        let project = ProjectId::new();
        store.create_project(project).await.unwrap();
        assert!(store.create_project(project).await.is_err());
    }

    #[tokio::test]
    async fn test_every_edit_bumps_version() {
        let (store, project, ids) = store_with_states(&["Todo", "Done"]).await;
        let before = store.snapshot(project).await.unwrap().version();

        store
            .add_transition(project, ids[0], ids[1], vec!["admin".into()], &"admin".into())
            .await
            .unwrap();
        let after = store.snapshot(project).await.unwrap();

        assert_eq!(after.version(), before + 1);
        assert!(after.rule(ids[0], ids[1]).is_some());
    }

    #[tokio::test]
    async fn test_failed_edit_changes_nothing() {
        let (store, project, ids) = store_with_states(&["Todo", "Done"]).await;
        let before = store.snapshot(project).await.unwrap().version();

        let err = store
            .add_transition(project, ids[0], StateId::new(), vec![], &"admin".into())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::StateNotFound(_)));

        assert_eq!(store.snapshot(project).await.unwrap().version(), before);
        let history = store.change_history(project).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_reset_is_atomic_for_readers() {
        let (store, project, ids) = store_with_states(&["Todo", "Doing", "Done"]).await;
        let admin: Principal = "admin".into();
        store
            .add_transition(project, ids[0], ids[1], vec![admin.clone()], &admin)
            .await
            .unwrap();
        store
            .add_transition(project, ids[1], ids[2], vec![admin.clone()], &admin)
            .await
            .unwrap();

        let held = store.snapshot(project).await.unwrap();
        store.reset_workflow(project, &admin).await.unwrap();

        assert_eq!(held.transitions().len(), 2);
        assert!(store.list_transitions(project).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_change_history_oldest_first() {
        let (store, project, ids) = store_with_states(&["Todo", "Done"]).await;
        let admin: Principal = "admin".into();
        store.set_workflow_enabled(project, true, &admin).await.unwrap();
        store
            .set_creation_allowed(project, ids[1], false, &admin)
            .await
            .unwrap();
        store.reset_workflow(project, &admin).await.unwrap();

        let kinds: Vec<_> = store
            .change_history(project)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.kind)
            .collect();

        assert_eq!(
            kinds,
            vec![
                WorkflowChangeKind::StateAdded { state_id: ids[0] },
                WorkflowChangeKind::StateAdded { state_id: ids[1] },
                WorkflowChangeKind::WorkflowEnabled,
                WorkflowChangeKind::CreationDisallowed { state_id: ids[1] },
                WorkflowChangeKind::WorkflowReset,
            ]
        );
    }

    #[tokio::test]
    async fn test_snapshot_is_cached() {
        let (store, project, _) = store_with_states(&["Todo"]).await;
        let a = store.snapshot(project).await.unwrap();
        let b = store.snapshot(project).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
