//! Trigger → job definition reconciliation.
//!
//! One pass compares the control plane's ingestion triggers with the stored
//! job definitions and issues the minimum set of writes:
//!
//! - eligible trigger, no definition: insert an active definition
//! - eligible trigger, only inactive definitions: reactivate them (one update)
//! - active definition whose trigger is ineligible or gone: deactivate it
//! - everything else: untouched
//!
//! Definitions are never deleted. Passes must not overlap.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use sluice_core::config::SyncConfig;
use sluice_core::{
    parse_integration_whitelist, parse_trigger_type_whitelist, DefinitionWhere, IngestionTrigger, IntegrationType,
    JobDefinition, JobDefinitionFilter, JobDefinitionUpdate, WhitelistEntry,
};
use sluice_storage::JobDefinitionStore;

use crate::error::SyncError;
use crate::supplier::SupplierRegistry;

/// Admission control applied to every trigger.
#[derive(Debug, Clone, Default)]
pub struct Whitelists {
    pub trigger_types: HashSet<IntegrationType>,
    pub trigger_types_enabled: bool,
    pub integrations: HashSet<WhitelistEntry>,
    pub integrations_enabled: bool,
}

impl Whitelists {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            trigger_types: parse_trigger_type_whitelist(&config.trigger_type_whitelist),
            trigger_types_enabled: config.trigger_type_whitelist_enabled,
            integrations: parse_integration_whitelist(&config.integration_whitelist),
            integrations_enabled: config.integration_whitelist_enabled,
        }
    }
}

/// Why a trigger was or was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Disabled,
    NoSupplier,
    TypeNotWhitelisted,
    IntegrationNotWhitelisted,
}

/// Writes issued by one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub inserted: usize,
    pub activated: usize,
    pub deactivated: usize,
    pub unchanged: usize,
    /// Ineligible triggers with nothing to deactivate.
    pub ignored: usize,
    /// Writes that failed and will be retried next pass.
    pub failed: usize,
}

impl SyncReport {
    pub fn writes(&self) -> usize {
        self.inserted + self.activated + self.deactivated
    }
}

pub struct TriggerSynchronizer {
    store: Arc<dyn JobDefinitionStore>,
    suppliers: SupplierRegistry,
    whitelists: Whitelists,
}

impl TriggerSynchronizer {
    pub fn new(store: Arc<dyn JobDefinitionStore>, suppliers: SupplierRegistry, whitelists: Whitelists) -> Self {
        Self {
            store,
            suppliers,
            whitelists,
        }
    }

    pub fn eligibility(&self, trigger: &IngestionTrigger) -> Eligibility {
        if !trigger.is_enabled() {
            return Eligibility::Disabled;
        }
        if !self.suppliers.contains(&trigger.trigger_type) {
            return Eligibility::NoSupplier;
        }
        if self.whitelists.trigger_types_enabled && !self.whitelists.trigger_types.contains(&trigger.trigger_type) {
            return Eligibility::TypeNotWhitelisted;
        }
        if self.whitelists.integrations_enabled && !self.whitelists.integrations.contains(&trigger.whitelist_key()) {
            return Eligibility::IntegrationNotWhitelisted;
        }
        Eligibility::Eligible
    }

    /// Run one reconciliation pass over `triggers`.
    ///
    /// Listing failures abort the pass; individual write failures are
    /// logged, counted in [`SyncReport::failed`], and retried next pass.
    pub async fn sync(&self, triggers: &[IngestionTrigger]) -> Result<SyncReport, SyncError> {
        let definitions = self.store.list_definitions(&JobDefinitionFilter::default()).await?;

        let mut by_trigger: HashMap<&str, Vec<&JobDefinition>> = HashMap::new();
        for definition in &definitions {
            if let Some(trigger_id) = definition.ingestion_trigger_id.as_deref() {
                by_trigger.entry(trigger_id).or_default().push(definition);
            }
        }

        let mut report = SyncReport::default();
        let mut eligible: HashSet<&str> = HashSet::new();
        let mut seen: HashSet<&str> = HashSet::new();

        for trigger in triggers {
            if !seen.insert(trigger.trigger_id.as_str()) {
                debug!(trigger_id = %trigger.trigger_id, "duplicate trigger in input, skipping");
                continue;
            }
            let verdict = self.eligibility(trigger);
            if verdict != Eligibility::Eligible {
                debug!(trigger_id = %trigger.trigger_id, reason = ?verdict, "trigger not eligible");
                let has_active = by_trigger
                    .get(trigger.trigger_id.as_str())
                    .is_some_and(|defs| defs.iter().any(|d| d.is_active));
                if !has_active {
                    report.ignored += 1;
                }
                continue;
            }
            eligible.insert(trigger.trigger_id.as_str());

            match by_trigger.get(trigger.trigger_id.as_str()) {
                None => self.insert(trigger, &mut report).await,
                Some(defs) if defs.iter().any(|d| d.is_active) => report.unchanged += 1,
                Some(_) => self.reactivate(trigger, &mut report).await,
            }
        }

        for (trigger_id, defs) in &by_trigger {
            if eligible.contains(trigger_id) {
                continue;
            }
            for definition in defs.iter().filter(|d| d.is_active) {
                self.deactivate(definition, &mut report).await;
            }
        }

        info!(
            inserted = report.inserted,
            activated = report.activated,
            deactivated = report.deactivated,
            unchanged = report.unchanged,
            ignored = report.ignored,
            failed = report.failed,
            "trigger sync pass complete"
        );
        Ok(report)
    }

    async fn insert(&self, trigger: &IngestionTrigger, report: &mut SyncReport) {
        let Some(supplier) = self.suppliers.get(&trigger.trigger_type) else {
            return;
        };
        let definition = JobDefinition::new(
            trigger.tenant_id.clone(),
            Some(trigger.integration_id.clone()),
            Some(supplier.integration_type()),
            supplier.etl_processor_name(),
            supplier.job_parameters(),
        )
        .with_trigger(trigger.trigger_id.clone());

        match self.store.insert_definition(&definition).await {
            Ok(()) => {
                info!(
                    trigger_id = %trigger.trigger_id,
                    tenant_id = %trigger.tenant_id,
                    integration_id = %trigger.integration_id,
                    definition_id = %definition.id,
                    processor = %definition.processor_name,
                    "job definition created"
                );
                report.inserted += 1;
            }
            Err(e) => {
                warn!(trigger_id = %trigger.trigger_id, error = %e, "failed to create job definition");
                report.failed += 1;
            }
        }
    }

    async fn reactivate(&self, trigger: &IngestionTrigger, report: &mut SyncReport) {
        let update = JobDefinitionUpdate {
            where_clause: DefinitionWhere {
                ingestion_trigger_id: Some(trigger.trigger_id.clone()),
                ..Default::default()
            },
            is_active: Some(true),
            ..Default::default()
        };
        match self.store.update_definition(&update).await {
            Ok(rows) => {
                info!(trigger_id = %trigger.trigger_id, rows, "job definition reactivated");
                report.activated += 1;
            }
            Err(e) => {
                warn!(trigger_id = %trigger.trigger_id, error = %e, "failed to reactivate job definition");
                report.failed += 1;
            }
        }
    }

    async fn deactivate(&self, definition: &JobDefinition, report: &mut SyncReport) {
        let update = JobDefinitionUpdate {
            where_clause: DefinitionWhere::by_id(definition.id),
            is_active: Some(false),
            ..Default::default()
        };
        match self.store.update_definition(&update).await {
            Ok(_) => {
                info!(
                    definition_id = %definition.id,
                    trigger_id = ?definition.ingestion_trigger_id,
                    "job definition deactivated"
                );
                report.deactivated += 1;
            }
            Err(e) => {
                warn!(definition_id = %definition.id, error = %e, "failed to deactivate job definition");
                report.failed += 1;
            }
        }
    }
}
