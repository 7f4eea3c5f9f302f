//! In-process job store for tests and single-node runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use sluice_core::{
    JobDefinition, JobDefinitionFilter, JobDefinitionId, JobDefinitionUpdate, JobInstance,
    JobInstanceFilter, JobInstanceId, JobInstanceUpdate, NewJobInstance,
};

use crate::error::StoreError;
use crate::store::{JobDefinitionStore, JobInstanceStore};

/// Call counters, for asserting how many writes an operation issued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub definition_inserts: u64,
    pub definition_updates: u64,
    pub instance_updates: u64,
}

#[derive(Default)]
struct Inner {
    definitions: HashMap<JobDefinitionId, JobDefinition>,
    instances: BTreeMap<(JobDefinitionId, i32), JobInstance>,
    next_instance_id: HashMap<JobDefinitionId, i32>,
    update_log: Vec<(JobInstanceId, JobInstanceUpdate)>,
}

#[derive(Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
    definition_inserts: AtomicU64,
    definition_updates: AtomicU64,
    instance_updates: AtomicU64,
    fail_instance_updates: AtomicBool,
    record_updates: bool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep every accepted instance update for [`Self::instance_update_log`].
    /// Off by default; the log grows without bound.
    pub fn with_update_log(mut self) -> Self {
        self.record_updates = true;
        self
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            definition_inserts: self.definition_inserts.load(Ordering::Relaxed),
            definition_updates: self.definition_updates.load(Ordering::Relaxed),
            instance_updates: self.instance_updates.load(Ordering::Relaxed),
        }
    }

    /// Instance updates accepted so far, in order. Empty unless the store
    /// was built [`with_update_log`](Self::with_update_log).
    pub async fn instance_update_log(&self, id: &JobInstanceId) -> Vec<JobInstanceUpdate> {
        let inner = self.inner.read().await;
        inner
            .update_log
            .iter()
            .filter(|(logged, _)| logged == id)
            .map(|(_, update)| update.clone())
            .collect()
    }

    /// Make subsequent instance updates fail, simulating an outage.
    pub fn set_instance_updates_failing(&self, failing: bool) {
        self.fail_instance_updates.store(failing, Ordering::Relaxed);
    }

    /// Store a fully-formed instance as-is, bypassing id assignment.
    pub async fn put_instance(&self, instance: JobInstance) {
        let mut inner = self.inner.write().await;
        let key = (instance.id.job_definition_id, instance.id.instance_id);
        let next = inner.next_instance_id.entry(key.0).or_insert(1);
        if *next <= key.1 {
            *next = key.1 + 1;
        }
        inner.instances.insert(key, instance);
    }
}

#[async_trait]
impl JobDefinitionStore for InMemoryJobStore {
    async fn insert_definition(&self, definition: &JobDefinition) -> Result<(), StoreError> {
        self.definition_inserts.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.write().await;
        if inner.definitions.contains_key(&definition.id) {
            return Err(StoreError::DuplicateDefinition(definition.id));
        }
        inner.definitions.insert(definition.id, definition.clone());
        Ok(())
    }

    async fn update_definition(&self, update: &JobDefinitionUpdate) -> Result<u64, StoreError> {
        if update.where_clause.is_empty() {
            return Err(StoreError::UnscopedUpdate);
        }
        self.definition_updates.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.write().await;
        let mut changed = 0;
        for definition in inner.definitions.values_mut() {
            if !update.where_clause.matches(definition) {
                continue;
            }
            if let Some(active) = update.is_active {
                definition.is_active = active;
            }
            if let Some(metadata) = &update.metadata {
                definition.metadata = metadata.clone();
            }
            if let Some(ts) = update.last_iteration_ts {
                definition.last_iteration_ts = Some(ts);
            }
            changed += 1;
        }
        Ok(changed)
    }

    async fn get_definition(&self, id: JobDefinitionId) -> Result<Option<JobDefinition>, StoreError> {
        Ok(self.inner.read().await.definitions.get(&id).cloned())
    }

    async fn list_definitions(&self, filter: &JobDefinitionFilter) -> Result<Vec<JobDefinition>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<JobDefinition> = inner
            .definitions
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}

#[async_trait]
impl JobInstanceStore for InMemoryJobStore {
    async fn insert_instance(&self, instance: NewJobInstance) -> Result<JobInstanceId, StoreError> {
        let mut inner = self.inner.write().await;
        let definition_id = instance.job_definition_id;
        let next = inner.next_instance_id.entry(definition_id).or_insert(1);
        let instance_id = *next;
        *next += 1;
        let stored = instance.into_instance(instance_id, Utc::now());
        let id = stored.id;
        inner.instances.insert((definition_id, instance_id), stored);
        Ok(id)
    }

    async fn get_instance(&self, id: &JobInstanceId) -> Result<Option<JobInstance>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.instances.get(&(id.job_definition_id, id.instance_id)).cloned())
    }

    async fn update_instance(&self, id: &JobInstanceId, update: &JobInstanceUpdate) -> Result<bool, StoreError> {
        self.instance_updates.fetch_add(1, Ordering::Relaxed);
        if self.fail_instance_updates.load(Ordering::Relaxed) {
            return Err(StoreError::Other("job store unavailable".into()));
        }
        let mut inner = self.inner.write().await;
        let Some(instance) = inner.instances.get_mut(&(id.job_definition_id, id.instance_id)) else {
            return Ok(false);
        };
        if !update.conditions_hold(instance) {
            return Ok(false);
        }
        update.apply_to(instance, Utc::now());
        if self.record_updates {
            inner.update_log.push((*id, update.clone()));
        }
        Ok(true)
    }

    async fn list_instances(&self, filter: &JobInstanceFilter) -> Result<Vec<JobInstance>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<JobInstance> = inner
            .instances
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.scheduled_start_time.cmp(&b.scheduled_start_time))
        });
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }
}
