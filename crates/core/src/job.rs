//! Job definitions, job instances, and the partial updates applied to them.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SluiceError;
use crate::progress::{ProgressDetailMap, ProgressMap};
use crate::trigger::IntegrationType;

pub type JobDefinitionId = Uuid;

/// Free-form metadata attached to definitions and instances.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

// ── Identity ──────────────────────────────────────────────────

/// Identity of one execution attempt: `(job_definition_id, instance_id)`.
///
/// `instance_id` is a serial number scoped to the definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobInstanceId {
    pub job_definition_id: JobDefinitionId,
    pub instance_id: i32,
}

impl JobInstanceId {
    pub fn new(job_definition_id: JobDefinitionId, instance_id: i32) -> Self {
        Self {
            job_definition_id,
            instance_id,
        }
    }
}

impl fmt::Display for JobInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.job_definition_id, self.instance_id)
    }
}

// ── Status ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Unassigned,
    Scheduled,
    Pending,
    Accepted,
    Success,
    Failure,
    Canceled,
    PartialSuccess,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Unassigned => "unassigned",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Pending => "pending",
            JobStatus::Accepted => "accepted",
            JobStatus::Success => "success",
            JobStatus::Failure => "failure",
            JobStatus::Canceled => "canceled",
            JobStatus::PartialSuccess => "partial_success",
        }
    }

    /// Whether the instance has reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failure | JobStatus::Canceled | JobStatus::PartialSuccess
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unassigned" => Ok(JobStatus::Unassigned),
            "scheduled" => Ok(JobStatus::Scheduled),
            "pending" => Ok(JobStatus::Pending),
            "accepted" => Ok(JobStatus::Accepted),
            "success" => Ok(JobStatus::Success),
            "failure" => Ok(JobStatus::Failure),
            "canceled" => Ok(JobStatus::Canceled),
            "partial_success" => Ok(JobStatus::PartialSuccess),
            other => Err(SluiceError::InvalidStatus(other.to_string())),
        }
    }
}

// ── Job type ──────────────────────────────────────────────────

/// What kind of processing a definition schedules.
///
/// Only result-processing jobs run a named stage sequence; the generic
/// variants have no stage checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    IngestionResultProcessing,
    GenericIntegration,
    GenericTenant,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::IngestionResultProcessing => "ingestion_result_processing",
            JobType::GenericIntegration => "generic_integration",
            JobType::GenericTenant => "generic_tenant",
        }
    }

    pub fn is_generic(&self) -> bool {
        !matches!(self, JobType::IngestionResultProcessing)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingestion_result_processing" => Ok(JobType::IngestionResultProcessing),
            "generic_integration" => Ok(JobType::GenericIntegration),
            "generic_tenant" => Ok(JobType::GenericTenant),
            other => Err(SluiceError::InvalidJobType(other.to_string())),
        }
    }
}

/// Scheduling priority. Lower numeric value runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    High = 1,
    Medium = 2,
    Low = 3,
}

impl JobPriority {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            i32::MIN..=1 => JobPriority::High,
            2 => JobPriority::Medium,
            _ => JobPriority::Low,
        }
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Medium
    }
}

// ── Payload ───────────────────────────────────────────────────

/// Input handed to a processing job, stored inline or as a blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(pub serde_json::Value);

impl Payload {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

// ── Job definition ────────────────────────────────────────────

/// Scheduling defaults a parameter supplier hands out for new definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinitionParameters {
    pub job_type: JobType,
    pub default_priority: JobPriority,
    pub attempt_max: i32,
    pub retry_wait_minutes: i32,
    pub timeout_minutes: i32,
    pub frequency_minutes: i32,
    pub full_frequency_minutes: i32,
}

impl Default for JobDefinitionParameters {
    fn default() -> Self {
        Self {
            job_type: JobType::IngestionResultProcessing,
            default_priority: JobPriority::Medium,
            attempt_max: 3,
            retry_wait_minutes: 5,
            timeout_minutes: 60,
            frequency_minutes: 60,
            full_frequency_minutes: 60 * 24 * 7,
        }
    }
}

/// One scheduled job per tenant + integration + processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: JobDefinitionId,
    pub tenant_id: String,
    pub integration_id: Option<String>,
    pub integration_type: Option<IntegrationType>,
    /// Back-reference to the trigger that produced this definition.
    pub ingestion_trigger_id: Option<String>,
    pub processor_name: String,
    pub is_active: bool,
    pub parameters: JobDefinitionParameters,
    pub last_iteration_ts: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

impl JobDefinition {
    /// New active definition with a fresh id and empty metadata.
    pub fn new(
        tenant_id: impl Into<String>,
        integration_id: Option<String>,
        integration_type: Option<IntegrationType>,
        processor_name: impl Into<String>,
        parameters: JobDefinitionParameters,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            integration_id,
            integration_type,
            ingestion_trigger_id: None,
            processor_name: processor_name.into(),
            is_active: true,
            parameters,
            last_iteration_ts: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_trigger(mut self, trigger_id: impl Into<String>) -> Self {
        self.ingestion_trigger_id = Some(trigger_id.into());
        self
    }
}

/// Rows a definition update applies to. Every populated field must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DefinitionWhere {
    pub id: Option<JobDefinitionId>,
    pub tenant_id: Option<String>,
    pub integration_id: Option<String>,
    pub ingestion_trigger_id: Option<String>,
}

impl DefinitionWhere {
    pub fn by_id(id: JobDefinitionId) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.tenant_id.is_none()
            && self.integration_id.is_none()
            && self.ingestion_trigger_id.is_none()
    }

    pub fn matches(&self, definition: &JobDefinition) -> bool {
        self.id.map_or(true, |id| id == definition.id)
            && self
                .tenant_id
                .as_ref()
                .map_or(true, |t| *t == definition.tenant_id)
            && self
                .integration_id
                .as_ref()
                .map_or(true, |i| Some(i) == definition.integration_id.as_ref())
            && self
                .ingestion_trigger_id
                .as_ref()
                .map_or(true, |t| Some(t) == definition.ingestion_trigger_id.as_ref())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobDefinitionUpdate {
    pub where_clause: DefinitionWhere,
    pub is_active: Option<bool>,
    pub metadata: Option<Metadata>,
    pub last_iteration_ts: Option<DateTime<Utc>>,
}

impl JobDefinitionUpdate {
    pub fn is_noop(&self) -> bool {
        self.is_active.is_none() && self.metadata.is_none() && self.last_iteration_ts.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobDefinitionFilter {
    pub tenant_id: Option<String>,
    pub ingestion_trigger_ids: Option<Vec<String>>,
    pub is_active: Option<bool>,
}

impl JobDefinitionFilter {
    pub fn matches(&self, definition: &JobDefinition) -> bool {
        if let Some(tenant) = &self.tenant_id {
            if *tenant != definition.tenant_id {
                return false;
            }
        }
        if let Some(ids) = &self.ingestion_trigger_ids {
            match &definition.ingestion_trigger_id {
                Some(id) if ids.contains(id) => {}
                _ => return false,
            }
        }
        if let Some(active) = self.is_active {
            if active != definition.is_active {
                return false;
            }
        }
        true
    }
}

// ── Job instance ──────────────────────────────────────────────

/// One concrete execution attempt of a [`JobDefinition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: JobInstanceId,
    pub tenant_id: String,
    pub integration_id: Option<String>,
    pub integration_type: Option<IntegrationType>,
    pub job_type: JobType,
    pub processor_name: String,
    pub status: JobStatus,
    pub worker_id: Option<String>,
    pub priority: JobPriority,
    pub attempt_count: i32,
    pub attempt_max: i32,
    pub timeout_minutes: i32,
    pub scheduled_start_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub is_full: bool,
    pub is_reprocessing: bool,
    pub progress: ProgressMap,
    pub progress_details: ProgressDetailMap,
    pub metadata: Metadata,
    pub payload: Option<Payload>,
    pub payload_reference: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobInstance {
    /// Whether a started run has outlived `timeout_minutes` at `now`.
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.start_time
            .map_or(false, |start| start + chrono::Duration::minutes(i64::from(self.timeout_minutes)) < now)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempt_count < self.attempt_max
    }
}

/// Fields of a new instance; the store assigns the instance number.
#[derive(Debug, Clone)]
pub struct NewJobInstance {
    pub job_definition_id: JobDefinitionId,
    pub tenant_id: String,
    pub integration_id: Option<String>,
    pub integration_type: Option<IntegrationType>,
    pub job_type: JobType,
    pub processor_name: String,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub attempt_max: i32,
    pub timeout_minutes: i32,
    pub scheduled_start_time: DateTime<Utc>,
    pub is_full: bool,
    pub is_reprocessing: bool,
    pub metadata: Metadata,
    pub payload: Option<Payload>,
    pub payload_reference: Option<String>,
    pub tags: Vec<String>,
}

impl NewJobInstance {
    /// A scheduled instance inheriting its defaults from `definition`.
    pub fn from_definition(definition: &JobDefinition, scheduled_start_time: DateTime<Utc>, is_full: bool) -> Self {
        Self {
            job_definition_id: definition.id,
            tenant_id: definition.tenant_id.clone(),
            integration_id: definition.integration_id.clone(),
            integration_type: definition.integration_type.clone(),
            job_type: definition.parameters.job_type,
            processor_name: definition.processor_name.clone(),
            status: JobStatus::Scheduled,
            priority: definition.parameters.default_priority,
            attempt_max: definition.parameters.attempt_max,
            timeout_minutes: definition.parameters.timeout_minutes,
            scheduled_start_time,
            is_full,
            is_reprocessing: false,
            metadata: Metadata::new(),
            payload: None,
            payload_reference: None,
            tags: Vec::new(),
        }
    }

    pub fn into_instance(self, instance_id: i32, now: DateTime<Utc>) -> JobInstance {
        JobInstance {
            id: JobInstanceId::new(self.job_definition_id, instance_id),
            tenant_id: self.tenant_id,
            integration_id: self.integration_id,
            integration_type: self.integration_type,
            job_type: self.job_type,
            processor_name: self.processor_name,
            status: self.status,
            worker_id: None,
            priority: self.priority,
            attempt_count: 0,
            attempt_max: self.attempt_max,
            timeout_minutes: self.timeout_minutes,
            scheduled_start_time: self.scheduled_start_time,
            start_time: None,
            last_heartbeat: None,
            is_full: self.is_full,
            is_reprocessing: self.is_reprocessing,
            progress: HashMap::new(),
            progress_details: HashMap::new(),
            metadata: self.metadata,
            payload: self.payload,
            payload_reference: self.payload_reference,
            tags: self.tags,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update of a job instance. `None` fields are left untouched.
///
/// `status_condition` and `worker_id_condition` turn the update into a
/// compare-and-set: it only applies when the stored row still matches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobInstanceUpdate {
    pub status: Option<JobStatus>,
    pub worker_id: Option<String>,
    pub increment_attempt_count: bool,
    pub heartbeat: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub scheduled_start_time: Option<DateTime<Utc>>,
    pub progress: Option<ProgressMap>,
    pub progress_details: Option<ProgressDetailMap>,
    pub metadata: Option<Metadata>,
    pub payload_reference: Option<String>,
    pub status_condition: Option<JobStatus>,
    pub worker_id_condition: Option<String>,
}

impl JobInstanceUpdate {
    pub fn is_noop(&self) -> bool {
        self.status.is_none()
            && self.worker_id.is_none()
            && !self.increment_attempt_count
            && self.heartbeat.is_none()
            && self.start_time.is_none()
            && self.scheduled_start_time.is_none()
            && self.progress.is_none()
            && self.progress_details.is_none()
            && self.metadata.is_none()
            && self.payload_reference.is_none()
    }

    /// Whether the conditions hold against the stored row.
    pub fn conditions_hold(&self, instance: &JobInstance) -> bool {
        self.status_condition.map_or(true, |s| s == instance.status)
            && self
                .worker_id_condition
                .as_ref()
                .map_or(true, |w| Some(w) == instance.worker_id.as_ref())
    }

    /// Apply the populated fields to `instance` in place.
    pub fn apply_to(&self, instance: &mut JobInstance, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            instance.status = status;
        }
        if let Some(worker_id) = &self.worker_id {
            instance.worker_id = Some(worker_id.clone());
        }
        if self.increment_attempt_count {
            instance.attempt_count += 1;
        }
        if let Some(heartbeat) = self.heartbeat {
            instance.last_heartbeat = Some(heartbeat);
        }
        if let Some(start_time) = self.start_time {
            instance.start_time = Some(start_time);
        }
        if let Some(scheduled) = self.scheduled_start_time {
            instance.scheduled_start_time = scheduled;
        }
        if let Some(progress) = &self.progress {
            instance.progress = progress.clone();
        }
        if let Some(details) = &self.progress_details {
            instance.progress_details = details.clone();
        }
        if let Some(metadata) = &self.metadata {
            instance.metadata = metadata.clone();
        }
        if let Some(reference) = &self.payload_reference {
            instance.payload_reference = Some(reference.clone());
        }
        instance.updated_at = now;
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobInstanceFilter {
    pub job_definition_ids: Option<Vec<JobDefinitionId>>,
    pub statuses: Option<Vec<JobStatus>>,
    pub below_max_attempts: bool,
    pub scheduled_at_or_before: Option<DateTime<Utc>>,
    /// Heartbeat strictly older than this. Rows without a heartbeat never match.
    pub last_heartbeat_before: Option<DateTime<Utc>>,
    /// Started more than `timeout_minutes` before this instant.
    pub timed_out_as_of: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl JobInstanceFilter {
    pub fn matches(&self, instance: &JobInstance) -> bool {
        if let Some(ids) = &self.job_definition_ids {
            if !ids.contains(&instance.id.job_definition_id) {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&instance.status) {
                return false;
            }
        }
        if self.below_max_attempts && instance.attempt_count >= instance.attempt_max {
            return false;
        }
        if let Some(before) = self.scheduled_at_or_before {
            if instance.scheduled_start_time > before {
                return false;
            }
        }
        if let Some(before) = self.last_heartbeat_before {
            match instance.last_heartbeat {
                Some(heartbeat) if heartbeat < before => {}
                _ => return false,
            }
        }
        if let Some(now) = self.timed_out_as_of {
            if !instance.is_timed_out(now) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> JobDefinition {
        JobDefinition::new(
            "acme",
            Some("7".to_string()),
            Some(IntegrationType::new("jira")),
            "jira_issues",
            JobDefinitionParameters::default(),
        )
        .with_trigger("trigger-1")
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            JobStatus::Unassigned,
            JobStatus::Scheduled,
            JobStatus::Pending,
            JobStatus::Accepted,
            JobStatus::Success,
            JobStatus::Failure,
            JobStatus::Canceled,
            JobStatus::PartialSuccess,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn only_result_processing_is_staged() {
        assert!(!JobType::IngestionResultProcessing.is_generic());
        assert!(JobType::GenericIntegration.is_generic());
        assert!(JobType::GenericTenant.is_generic());
    }

    #[test]
    fn priority_from_i32_clamps() {
        assert_eq!(JobPriority::from_i32(0), JobPriority::High);
        assert_eq!(JobPriority::from_i32(2), JobPriority::Medium);
        assert_eq!(JobPriority::from_i32(9), JobPriority::Low);
    }

    #[test]
    fn where_clause_matches_on_populated_fields_only() {
        let def = definition();
        let by_trigger = DefinitionWhere {
            ingestion_trigger_id: Some("trigger-1".to_string()),
            ..Default::default()
        };
        assert!(by_trigger.matches(&def));
        assert!(DefinitionWhere::by_id(def.id).matches(&def));
        assert!(!DefinitionWhere::by_id(Uuid::new_v4()).matches(&def));
        assert!(DefinitionWhere::default().is_empty());
    }

    #[test]
    fn instance_update_respects_conditions() {
        let def = definition();
        let mut instance =
            NewJobInstance::from_definition(&def, Utc::now(), false).into_instance(1, Utc::now());

        let claim = JobInstanceUpdate {
            status: Some(JobStatus::Pending),
            worker_id: Some("w1".to_string()),
            increment_attempt_count: true,
            status_condition: Some(JobStatus::Scheduled),
            ..Default::default()
        };
        assert!(claim.conditions_hold(&instance));
        claim.apply_to(&mut instance, Utc::now());
        assert_eq!(instance.status, JobStatus::Pending);
        assert_eq!(instance.attempt_count, 1);

        // A second claim no longer sees `scheduled`.
        assert!(!claim.conditions_hold(&instance));
    }

    #[test]
    fn filter_excludes_exhausted_attempts() {
        let def = definition();
        let mut instance =
            NewJobInstance::from_definition(&def, Utc::now(), false).into_instance(1, Utc::now());
        let filter = JobInstanceFilter {
            below_max_attempts: true,
            ..Default::default()
        };
        assert!(filter.matches(&instance));
        instance.attempt_count = instance.attempt_max;
        assert!(!filter.matches(&instance));
    }

    #[test]
    fn filter_finds_stale_heartbeats_and_timeouts() {
        let def = definition();
        let now = Utc::now();
        let mut instance = NewJobInstance::from_definition(&def, now, false).into_instance(1, now);

        let stale = JobInstanceFilter {
            last_heartbeat_before: Some(now - chrono::Duration::minutes(10)),
            ..Default::default()
        };
        assert!(!stale.matches(&instance), "no heartbeat yet");
        instance.last_heartbeat = Some(now - chrono::Duration::hours(1));
        assert!(stale.matches(&instance));
        instance.last_heartbeat = Some(now);
        assert!(!stale.matches(&instance));

        let timed_out = JobInstanceFilter {
            timed_out_as_of: Some(now),
            ..Default::default()
        };
        assert!(!timed_out.matches(&instance), "never started");
        instance.start_time = Some(now - chrono::Duration::minutes(i64::from(instance.timeout_minutes) + 1));
        assert!(timed_out.matches(&instance));
        instance.start_time = Some(now);
        assert!(!timed_out.matches(&instance));
    }

    #[test]
    fn update_can_reschedule() {
        let def = definition();
        let now = Utc::now();
        let mut instance = NewJobInstance::from_definition(&def, now, false).into_instance(1, now);
        let later = now + chrono::Duration::minutes(5);
        let retry = JobInstanceUpdate {
            status: Some(JobStatus::Scheduled),
            scheduled_start_time: Some(later),
            ..Default::default()
        };
        assert!(!retry.is_noop());
        retry.apply_to(&mut instance, now);
        assert_eq!(instance.scheduled_start_time, later);
    }
}
