//! Automation persistence and lifecycle management.

use crate::model::{
    Action, ActivityKind, Automation, AutomationActivity, AutomationDraft, AutomationState,
    AutomationUpdate,
};
use crate::{AutomationError, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use flowrule_core::{AutomationId, EventKind, Principal, Scope};
use flowrule_infra::{KeyedLock, VersionedCache};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const EVENT_KINDS: [EventKind; 3] = [
    EventKind::EntityCreated,
    EventKind::PropertyChanged,
    EventKind::StateChanged,
];

/// Storage for automation definitions and their activity log.
#[async_trait]
pub trait AutomationRepository: Send + Sync {
    /// Insert or replace an automation.
    async fn save(&self, automation: &Automation) -> Result<()>;

    async fn get(&self, id: AutomationId) -> Result<Option<Automation>>;

    /// Returns whether the automation existed.
    async fn delete(&self, id: AutomationId) -> Result<bool>;

    /// All automations, or those of one scope.
    async fn list(&self, scope: Option<Scope>) -> Result<Vec<Automation>>;

    /// Highest creation sequence handed out so far.
    async fn max_creation_seq(&self) -> Result<u64>;

    async fn append_activity(&self, activity: AutomationActivity) -> Result<()>;

    /// Activity of one automation, oldest first.
    async fn list_activity(&self, id: AutomationId) -> Result<Vec<AutomationActivity>>;
}

/// In-memory automation repository
pub struct InMemoryAutomationRepository {
    automations: RwLock<HashMap<AutomationId, Automation>>,
    activity: RwLock<HashMap<AutomationId, Vec<AutomationActivity>>>,
}

impl InMemoryAutomationRepository {
    pub fn new() -> Self {
        Self {
            automations: RwLock::new(HashMap::new()),
            activity: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryAutomationRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AutomationRepository for InMemoryAutomationRepository {
    async fn save(&self, automation: &Automation) -> Result<()> {
        let mut automations = self.automations.write().await;
        automations.insert(automation.id, automation.clone());
        Ok(())
    }

    async fn get(&self, id: AutomationId) -> Result<Option<Automation>> {
        let automations = self.automations.read().await;
        Ok(automations.get(&id).cloned())
    }

    async fn delete(&self, id: AutomationId) -> Result<bool> {
        let mut automations = self.automations.write().await;
        Ok(automations.remove(&id).is_some())
    }

    async fn list(&self, scope: Option<Scope>) -> Result<Vec<Automation>> {
        let automations = self.automations.read().await;
        Ok(automations
            .values()
            .filter(|a| scope.map(|s| a.scope == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn max_creation_seq(&self) -> Result<u64> {
        let automations = self.automations.read().await;
        Ok(automations
            .values()
            .map(|a| a.creation_seq)
            .max()
            .unwrap_or(0))
    }

    async fn append_activity(&self, activity: AutomationActivity) -> Result<()> {
        let mut log = self.activity.write().await;
        log.entry(activity.automation_id).or_default().push(activity);
        Ok(())
    }

    async fn list_activity(&self, id: AutomationId) -> Result<Vec<AutomationActivity>> {
        let log = self.activity.read().await;
        Ok(log.get(&id).cloned().unwrap_or_default())
    }
}

/// Automation CRUD, the enable/disable state machine, and the trigger index.
///
/// Every definition change bumps a per-scope version, which keys the cached
/// `(scope, event kind)` lists returned by [`AutomationStore::list_enabled_for`].
pub struct AutomationStore {
    repository: Arc<dyn AutomationRepository>,
    scope_versions: DashMap<Scope, u64>,
    cache: VersionedCache<(Scope, EventKind), Vec<Automation>>,
    locks: KeyedLock<AutomationId>,
    creation_seq: AtomicU64,
}

impl AutomationStore {
    pub fn new(repository: Arc<dyn AutomationRepository>) -> Self {
        Self {
            repository,
            scope_versions: DashMap::new(),
            cache: VersionedCache::new(),
            locks: KeyedLock::new(),
            creation_seq: AtomicU64::new(0),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryAutomationRepository::new()))
    }

    /// Continue creation numbering after the automations already stored.
    pub async fn load_sequence(&self) -> Result<()> {
        let max = self.repository.max_creation_seq().await?;
        self.creation_seq.fetch_max(max, Ordering::SeqCst);
        Ok(())
    }

    /// Create a disabled automation.
    pub async fn create(&self, draft: AutomationDraft, actor: &Principal) -> Result<Automation> {
        let now = Utc::now();
        let automation = Automation {
            id: AutomationId::new(),
            scope: draft.scope,
            name: draft.name,
            description: draft.description,
            state: AutomationState::Disabled,
            trigger: draft.trigger,
            condition: draft.condition,
            actions: draft.actions,
            created_by: actor.clone(),
            created_at: now,
            updated_at: now,
            creation_seq: self.creation_seq.fetch_add(1, Ordering::SeqCst) + 1,
            revision: 1,
        };
        automation.validate_definition()?;

        self.repository.save(&automation).await?;
        self.bump_scope(automation.scope);
        self.repository
            .append_activity(AutomationActivity::new(
                &automation,
                actor,
                ActivityKind::Created,
            ))
            .await?;

        info!(
            automation_id = %automation.id,
            scope = %automation.scope,
            actor = %actor,
            "Automation created"
        );
        Ok(automation)
    }

    pub async fn get(&self, id: AutomationId) -> Result<Automation> {
        self.repository
            .get(id)
            .await?
            .ok_or_else(|| AutomationError::NotFound(format!("automation {}", id)))
    }

    /// Automations of one scope (or all), in creation order.
    pub async fn list(&self, scope: Option<Scope>) -> Result<Vec<Automation>> {
        let mut automations = self.repository.list(scope).await?;
        automations.sort_by_key(|a| a.creation_seq);
        Ok(automations)
    }

    /// Change the definition. An enabled automation must stay runnable.
    pub async fn update(
        &self,
        id: AutomationId,
        update: AutomationUpdate,
        actor: &Principal,
    ) -> Result<Automation> {
        if update.is_empty() {
            return self.get(id).await;
        }

        self.modify(id, actor, move |automation| {
            if let Some(name) = update.name {
                automation.name = name;
            }
            if let Some(description) = update.description {
                automation.description = Some(description);
            }
            if let Some(trigger) = update.trigger {
                automation.trigger = Some(trigger);
            }
            if let Some(condition) = update.condition {
                automation.condition = condition;
            }
            if let Some(actions) = update.actions {
                automation.actions = actions;
            }
            automation.validate_definition()?;
            if automation.is_enabled() {
                automation.check_enableable()?;
            }
            Ok(Some(ActivityKind::Updated))
        })
        .await
    }

    pub async fn enable(&self, id: AutomationId, actor: &Principal) -> Result<Automation> {
        self.modify(id, actor, |automation| {
            if automation.is_enabled() {
                return Ok(None);
            }
            automation.check_enableable()?;
            automation.state = AutomationState::Enabled;
            Ok(Some(ActivityKind::Enabled))
        })
        .await
    }

    /// Stop matching new events. Runs already queued finish normally.
    pub async fn disable(&self, id: AutomationId, actor: &Principal) -> Result<Automation> {
        self.modify(id, actor, |automation| {
            if !automation.is_enabled() {
                return Ok(None);
            }
            automation.state = AutomationState::Disabled;
            Ok(Some(ActivityKind::Disabled))
        })
        .await
    }

    pub async fn delete(&self, id: AutomationId, actor: &Principal) -> Result<()> {
        let _guard = self.locks.lock(id).await;
        let automation = self.get(id).await?;
        if automation.is_enabled() {
            warn!(automation_id = %id, actor = %actor, "Refused to delete enabled automation");
            return Err(AutomationError::PreconditionFailed(
                "disable the automation before deleting it".to_string(),
            ));
        }

        self.repository.delete(id).await?;
        self.bump_scope(automation.scope);
        self.repository
            .append_activity(AutomationActivity::new(
                &automation,
                actor,
                ActivityKind::Deleted,
            ))
            .await?;
        info!(automation_id = %id, actor = %actor, "Automation deleted");
        Ok(())
    }

    pub async fn add_action(
        &self,
        id: AutomationId,
        action: Action,
        actor: &Principal,
    ) -> Result<Automation> {
        action.validate()?;
        self.modify(id, actor, move |automation| {
            automation.actions.push(action);
            Ok(Some(ActivityKind::ActionAdded {
                index: automation.actions.len() - 1,
            }))
        })
        .await
    }

    pub async fn remove_action(
        &self,
        id: AutomationId,
        index: usize,
        actor: &Principal,
    ) -> Result<Automation> {
        self.modify(id, actor, move |automation| {
            if index >= automation.actions.len() {
                return Err(AutomationError::Validation(format!(
                    "action index {} out of range ({} actions)",
                    index,
                    automation.actions.len()
                )));
            }
            if automation.is_enabled() && automation.actions.len() == 1 {
                return Err(AutomationError::PreconditionFailed(
                    "disable the automation before deleting its only action".to_string(),
                ));
            }
            automation.actions.remove(index);
            Ok(Some(ActivityKind::ActionRemoved { index }))
        })
        .await
    }

    pub async fn activity(&self, id: AutomationId) -> Result<Vec<AutomationActivity>> {
        self.repository.list_activity(id).await
    }

    /// Enabled automations of `scope` triggered by `kind`, in creation order.
    pub async fn list_enabled_for(
        &self,
        scope: Scope,
        kind: EventKind,
    ) -> Result<Arc<Vec<Automation>>> {
        let version = self.scope_version(scope);
        let key = (scope, kind);
        if let Some(cached) = self.cache.get(&key, version) {
            return Ok(cached);
        }

        let mut matching: Vec<Automation> = self
            .repository
            .list(Some(scope))
            .await?
            .into_iter()
            .filter(|a| {
                a.is_enabled()
                    && a.trigger
                        .as_ref()
                        .map(|t| t.event_kind == kind)
                        .unwrap_or(false)
            })
            .collect();
        matching.sort_by_key(|a| a.creation_seq);

        debug!(scope = %scope, kind = %kind, version, count = matching.len(), "Loaded trigger index");
        Ok(self.cache.insert(key, version, matching))
    }

    fn scope_version(&self, scope: Scope) -> u64 {
        self.scope_versions.get(&scope).map(|v| *v).unwrap_or(0)
    }

    fn bump_scope(&self, scope: Scope) {
        *self.scope_versions.entry(scope).or_insert(0) += 1;
        for kind in EVENT_KINDS {
            self.cache.evict(&(scope, kind));
        }
    }

    /// Apply a change under the automation's lock. `apply` returns `None`
    /// when the automation is already in the requested shape.
    async fn modify<F>(&self, id: AutomationId, actor: &Principal, apply: F) -> Result<Automation>
    where
        F: FnOnce(&mut Automation) -> Result<Option<ActivityKind>> + Send,
    {
        let _guard = self.locks.lock(id).await;
        let mut automation = self.get(id).await?;

        let kind = match apply(&mut automation) {
            Ok(Some(kind)) => kind,
            Ok(None) => return Ok(automation),
            Err(e) => {
                warn!(automation_id = %id, actor = %actor, error = %e, "Automation change rejected");
                return Err(e);
            }
        };

        automation.revision += 1;
        automation.updated_at = Utc::now();
        self.repository.save(&automation).await?;
        self.bump_scope(automation.scope);

        info!(
            automation_id = %id,
            actor = %actor,
            revision = automation.revision,
            change = ?kind,
            "Automation updated"
        );

        self.repository
            .append_activity(AutomationActivity::new(&automation, actor, kind))
            .await?;
        Ok(automation)
    }
}
