//! PostgreSQL job store over the `job_definition` and `job_instance` tables.
//!
//! Partial updates use `COALESCE` so only the provided fields change;
//! instance conditions become extra `WHERE` predicates, so a lost race
//! shows up as zero affected rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{error, info};
use uuid::Uuid;

use sluice_core::config::PostgresConfig;
use sluice_core::{
    IntegrationType, JobDefinition, JobDefinitionFilter, JobDefinitionId, JobDefinitionParameters,
    JobDefinitionUpdate, JobInstance, JobInstanceFilter, JobInstanceId, JobInstanceUpdate,
    JobPriority, Metadata, NewJobInstance, Payload,
};

use crate::error::StoreError;
use crate::store::{JobDefinitionStore, JobInstanceStore};

const DEFINITION_COLUMNS: &str = "id, tenant_id, integration_id, integration_type, ingestion_trigger_id, \
     processor_name, is_active, job_type, default_priority, attempt_max, retry_wait_minutes, \
     timeout_minutes, frequency_minutes, full_frequency_minutes, last_iteration_ts, metadata";

const INSTANCE_COLUMNS: &str = "job_definition_id, instance_id, tenant_id, integration_id, integration_type, \
     job_type, processor_name, status, worker_id, priority, attempt_count, attempt_max, timeout_minutes, \
     scheduled_start_time, start_time, last_heartbeat, is_full, is_reprocessing, progress, \
     progress_details, metadata, payload, payload_reference, tags, created_at, updated_at";

// ── Rows ─────────────────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobDefinitionRow {
    id: Uuid,
    tenant_id: String,
    integration_id: Option<String>,
    integration_type: Option<String>,
    ingestion_trigger_id: Option<String>,
    processor_name: String,
    is_active: bool,
    job_type: String,
    default_priority: i32,
    attempt_max: i32,
    retry_wait_minutes: i32,
    timeout_minutes: i32,
    frequency_minutes: i32,
    full_frequency_minutes: i32,
    last_iteration_ts: Option<DateTime<Utc>>,
    metadata: serde_json::Value,
}

impl TryFrom<JobDefinitionRow> for JobDefinition {
    type Error = StoreError;

    fn try_from(row: JobDefinitionRow) -> Result<Self, Self::Error> {
        Ok(JobDefinition {
            id: row.id,
            tenant_id: row.tenant_id,
            integration_id: row.integration_id,
            integration_type: row.integration_type.map(IntegrationType::new),
            ingestion_trigger_id: row.ingestion_trigger_id,
            processor_name: row.processor_name,
            is_active: row.is_active,
            parameters: JobDefinitionParameters {
                job_type: row.job_type.parse()?,
                default_priority: JobPriority::from_i32(row.default_priority),
                attempt_max: row.attempt_max,
                retry_wait_minutes: row.retry_wait_minutes,
                timeout_minutes: row.timeout_minutes,
                frequency_minutes: row.frequency_minutes,
                full_frequency_minutes: row.full_frequency_minutes,
            },
            last_iteration_ts: row.last_iteration_ts,
            metadata: json_object(row.metadata)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobInstanceRow {
    job_definition_id: Uuid,
    instance_id: i32,
    tenant_id: String,
    integration_id: Option<String>,
    integration_type: Option<String>,
    job_type: String,
    processor_name: String,
    status: String,
    worker_id: Option<String>,
    priority: i32,
    attempt_count: i32,
    attempt_max: i32,
    timeout_minutes: i32,
    scheduled_start_time: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
    is_full: bool,
    is_reprocessing: bool,
    progress: serde_json::Value,
    progress_details: serde_json::Value,
    metadata: serde_json::Value,
    payload: Option<serde_json::Value>,
    payload_reference: Option<String>,
    tags: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobInstanceRow> for JobInstance {
    type Error = StoreError;

    fn try_from(row: JobInstanceRow) -> Result<Self, Self::Error> {
        Ok(JobInstance {
            id: JobInstanceId::new(row.job_definition_id, row.instance_id),
            tenant_id: row.tenant_id,
            integration_id: row.integration_id,
            integration_type: row.integration_type.map(IntegrationType::new),
            job_type: row.job_type.parse()?,
            processor_name: row.processor_name,
            status: row.status.parse()?,
            worker_id: row.worker_id,
            priority: JobPriority::from_i32(row.priority),
            attempt_count: row.attempt_count,
            attempt_max: row.attempt_max,
            timeout_minutes: row.timeout_minutes,
            scheduled_start_time: row.scheduled_start_time,
            start_time: row.start_time,
            last_heartbeat: row.last_heartbeat,
            is_full: row.is_full,
            is_reprocessing: row.is_reprocessing,
            progress: serde_json::from_value(row.progress)?,
            progress_details: serde_json::from_value(row.progress_details)?,
            metadata: json_object(row.metadata)?,
            payload: row.payload.map(Payload::new),
            payload_reference: row.payload_reference,
            tags: row.tags,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// JSONB `null` reads back as empty metadata.
fn json_object(value: serde_json::Value) -> Result<Metadata, StoreError> {
    match value {
        serde_json::Value::Null => Ok(Metadata::new()),
        other => Ok(serde_json::from_value(other)?),
    }
}

fn map_unique_violation(e: sqlx::Error, id: Uuid) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.code().as_deref() == Some("23505") {
            return StoreError::DuplicateDefinition(id);
        }
    }
    error!(error = %e, "job definition store database error");
    StoreError::Database(e)
}

// ── Store ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with the configured pool size and apply pending migrations.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.connection_string())
            .await?;
        info!(host = %config.host, db = %config.database, "PostgreSQL connected");
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("job store migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobDefinitionStore for PgJobStore {
    async fn insert_definition(&self, definition: &JobDefinition) -> Result<(), StoreError> {
        let p = &definition.parameters;
        sqlx::query(
            "INSERT INTO job_definition (id, tenant_id, integration_id, integration_type, ingestion_trigger_id,
                 processor_name, is_active, job_type, default_priority, attempt_max, retry_wait_minutes,
                 timeout_minutes, frequency_minutes, full_frequency_minutes, last_iteration_ts, metadata)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(definition.id)
        .bind(&definition.tenant_id)
        .bind(&definition.integration_id)
        .bind(definition.integration_type.as_ref().map(|t| t.as_str()))
        .bind(&definition.ingestion_trigger_id)
        .bind(&definition.processor_name)
        .bind(definition.is_active)
        .bind(p.job_type.as_str())
        .bind(p.default_priority.as_i32())
        .bind(p.attempt_max)
        .bind(p.retry_wait_minutes)
        .bind(p.timeout_minutes)
        .bind(p.frequency_minutes)
        .bind(p.full_frequency_minutes)
        .bind(definition.last_iteration_ts)
        .bind(serde_json::Value::Object(definition.metadata.clone()))
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, definition.id))?;
        Ok(())
    }

    async fn update_definition(&self, update: &JobDefinitionUpdate) -> Result<u64, StoreError> {
        let w = &update.where_clause;
        if w.is_empty() {
            return Err(StoreError::UnscopedUpdate);
        }
        let result = sqlx::query(
            "UPDATE job_definition SET
                is_active = COALESCE($5, is_active),
                metadata = COALESCE($6, metadata),
                last_iteration_ts = COALESCE($7, last_iteration_ts),
                updated_at = now()
             WHERE ($1::uuid IS NULL OR id = $1)
               AND ($2::text IS NULL OR tenant_id = $2)
               AND ($3::text IS NULL OR integration_id = $3)
               AND ($4::text IS NULL OR ingestion_trigger_id = $4)",
        )
        .bind(w.id)
        .bind(&w.tenant_id)
        .bind(&w.integration_id)
        .bind(&w.ingestion_trigger_id)
        .bind(update.is_active)
        .bind(update.metadata.clone().map(serde_json::Value::Object))
        .bind(update.last_iteration_ts)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_definition(&self, id: JobDefinitionId) -> Result<Option<JobDefinition>, StoreError> {
        let sql = format!("SELECT {DEFINITION_COLUMNS} FROM job_definition WHERE id = $1");
        let row = sqlx::query_as::<_, JobDefinitionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobDefinition::try_from).transpose()
    }

    async fn list_definitions(&self, filter: &JobDefinitionFilter) -> Result<Vec<JobDefinition>, StoreError> {
        let sql = format!(
            "SELECT {DEFINITION_COLUMNS} FROM job_definition
             WHERE ($1::text IS NULL OR tenant_id = $1)
               AND ($2::text[] IS NULL OR ingestion_trigger_id = ANY($2))
               AND ($3::bool IS NULL OR is_active = $3)
             ORDER BY tenant_id, id"
        );
        let rows = sqlx::query_as::<_, JobDefinitionRow>(&sql)
            .bind(&filter.tenant_id)
            .bind(&filter.ingestion_trigger_ids)
            .bind(filter.is_active)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(JobDefinition::try_from).collect()
    }
}

#[async_trait]
impl JobInstanceStore for PgJobStore {
    async fn insert_instance(&self, instance: NewJobInstance) -> Result<JobInstanceId, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Row lock on the definition serialises id assignment.
        sqlx::query("SELECT id FROM job_definition WHERE id = $1 FOR UPDATE")
            .bind(instance.job_definition_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::DefinitionNotFound(instance.job_definition_id))?;

        let instance_id: i32 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(instance_id), 0) + 1 FROM job_instance WHERE job_definition_id = $1",
        )
        .bind(instance.job_definition_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO job_instance (job_definition_id, instance_id, tenant_id, integration_id,
                 integration_type, job_type, processor_name, status, priority, attempt_max, timeout_minutes,
                 scheduled_start_time, is_full, is_reprocessing, metadata, payload, payload_reference, tags)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
        )
        .bind(instance.job_definition_id)
        .bind(instance_id)
        .bind(&instance.tenant_id)
        .bind(&instance.integration_id)
        .bind(instance.integration_type.as_ref().map(|t| t.as_str()))
        .bind(instance.job_type.as_str())
        .bind(&instance.processor_name)
        .bind(instance.status.as_str())
        .bind(instance.priority.as_i32())
        .bind(instance.attempt_max)
        .bind(instance.timeout_minutes)
        .bind(instance.scheduled_start_time)
        .bind(instance.is_full)
        .bind(instance.is_reprocessing)
        .bind(serde_json::Value::Object(instance.metadata))
        .bind(instance.payload.map(|p| p.0))
        .bind(&instance.payload_reference)
        .bind(&instance.tags)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(JobInstanceId::new(instance.job_definition_id, instance_id))
    }

    async fn get_instance(&self, id: &JobInstanceId) -> Result<Option<JobInstance>, StoreError> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM job_instance WHERE job_definition_id = $1 AND instance_id = $2"
        );
        let row = sqlx::query_as::<_, JobInstanceRow>(&sql)
            .bind(id.job_definition_id)
            .bind(id.instance_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobInstance::try_from).transpose()
    }

    async fn update_instance(&self, id: &JobInstanceId, update: &JobInstanceUpdate) -> Result<bool, StoreError> {
        let progress = update.progress.as_ref().map(serde_json::to_value).transpose()?;
        let details = update.progress_details.as_ref().map(serde_json::to_value).transpose()?;

        let result = sqlx::query(
            "UPDATE job_instance SET
                status = COALESCE($3, status),
                worker_id = COALESCE($4, worker_id),
                attempt_count = attempt_count + CASE WHEN $5 THEN 1 ELSE 0 END,
                last_heartbeat = COALESCE($6, last_heartbeat),
                start_time = COALESCE($7, start_time),
                scheduled_start_time = COALESCE($8, scheduled_start_time),
                progress = COALESCE($9, progress),
                progress_details = COALESCE($10, progress_details),
                metadata = COALESCE($11, metadata),
                payload_reference = COALESCE($12, payload_reference),
                updated_at = now()
             WHERE job_definition_id = $1 AND instance_id = $2
               AND ($13::text IS NULL OR status = $13)
               AND ($14::text IS NULL OR worker_id = $14)",
        )
        .bind(id.job_definition_id)
        .bind(id.instance_id)
        .bind(update.status.map(|s| s.as_str()))
        .bind(&update.worker_id)
        .bind(update.increment_attempt_count)
        .bind(update.heartbeat)
        .bind(update.start_time)
        .bind(update.scheduled_start_time)
        .bind(progress)
        .bind(details)
        .bind(update.metadata.clone().map(serde_json::Value::Object))
        .bind(&update.payload_reference)
        .bind(update.status_condition.map(|s| s.as_str()))
        .bind(&update.worker_id_condition)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_instances(&self, filter: &JobInstanceFilter) -> Result<Vec<JobInstance>, StoreError> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM job_instance
             WHERE ($1::uuid[] IS NULL OR job_definition_id = ANY($1))
               AND ($2::text[] IS NULL OR status = ANY($2))
               AND (NOT $3 OR attempt_count < attempt_max)
               AND ($4::timestamptz IS NULL OR scheduled_start_time <= $4)
               AND ($5::timestamptz IS NULL OR last_heartbeat < $5)
               AND ($6::timestamptz IS NULL
                    OR start_time + make_interval(mins => timeout_minutes) < $6)
             ORDER BY priority, scheduled_start_time
             LIMIT $7"
        );
        let statuses: Option<Vec<String>> = filter
            .statuses
            .as_ref()
            .map(|s| s.iter().map(|status| status.as_str().to_string()).collect());
        let rows = sqlx::query_as::<_, JobInstanceRow>(&sql)
            .bind(&filter.job_definition_ids)
            .bind(statuses)
            .bind(filter.below_max_attempts)
            .bind(filter.scheduled_at_or_before)
            .bind(filter.last_heartbeat_before)
            .bind(filter.timed_out_as_of)
            .bind(filter.limit.map(|l| l as i64))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(JobInstance::try_from).collect()
    }
}
