//! PgStore — PostgreSQL persistence for the distributed flavor.
//!
//! Cross-replica transitions go through CTEs that select with
//! `FOR UPDATE SKIP LOCKED` and update in the same statement, so two
//! replicas can never claim the same instance or outbox row.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, QueryBuilder};
use tracing::debug;
use warmpool_core::{Platform, epoch_secs};

use crate::error::{StateError, StateResult};
use crate::stores::*;
use crate::types::*;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS instances (
        instance_id TEXT PRIMARY KEY,
        instance_name TEXT NOT NULL,
        instance_node_id TEXT,
        instance_address TEXT NOT NULL DEFAULT '',
        instance_provider TEXT NOT NULL,
        instance_state TEXT NOT NULL,
        instance_pool TEXT NOT NULL,
        instance_image TEXT NOT NULL DEFAULT '',
        instance_region TEXT NOT NULL DEFAULT '',
        instance_zone TEXT NOT NULL DEFAULT '',
        instance_size TEXT NOT NULL DEFAULT '',
        instance_os TEXT NOT NULL DEFAULT '',
        instance_arch TEXT NOT NULL DEFAULT '',
        instance_variant TEXT NOT NULL DEFAULT '',
        instance_version TEXT NOT NULL DEFAULT '',
        instance_os_name TEXT NOT NULL DEFAULT '',
        variant_id TEXT NOT NULL DEFAULT 'default',
        instance_stage TEXT NOT NULL DEFAULT '',
        instance_ca_key TEXT NOT NULL DEFAULT '',
        instance_ca_cert TEXT NOT NULL DEFAULT '',
        instance_tls_key TEXT NOT NULL DEFAULT '',
        instance_tls_cert TEXT NOT NULL DEFAULT '',
        instance_started BIGINT NOT NULL,
        instance_updated BIGINT NOT NULL,
        is_hibernated BOOLEAN NOT NULL DEFAULT FALSE,
        instance_port BIGINT NOT NULL DEFAULT 0,
        instance_owner_id TEXT NOT NULL DEFAULT '',
        runner_name TEXT NOT NULL DEFAULT '',
        instance_storage_identifier TEXT NOT NULL DEFAULT '',
        instance_labels JSONB NOT NULL DEFAULT '{}'::jsonb
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_instances_pool_state
    ON instances(instance_pool, instance_state, instance_started)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stage_owner (
        stage_id TEXT PRIMARY KEY,
        pool_name TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS capacity_reservation (
        stage_id TEXT PRIMARY KEY,
        pool_name TEXT NOT NULL,
        instance_id TEXT NOT NULL DEFAULT '',
        machine_ip TEXT NOT NULL DEFAULT '',
        gcp_reservation_id TEXT NOT NULL,
        zone TEXT NOT NULL DEFAULT '',
        created_at BIGINT NOT NULL
    )
    "#,
    r#"
    DO $$
    BEGIN
        IF EXISTS (
            SELECT 1 FROM information_schema.columns
            WHERE table_name = 'capacity_reservation' AND column_name = 'reservation_id'
        ) THEN
            ALTER TABLE capacity_reservation RENAME COLUMN reservation_id TO gcp_reservation_id;
        END IF;
    END
    $$
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS outbox_jobs (
        id BIGSERIAL PRIMARY KEY,
        pool_name TEXT NOT NULL,
        runner_name TEXT NOT NULL DEFAULT '',
        job_type TEXT NOT NULL,
        job_params JSONB NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        created_at BIGINT NOT NULL,
        processed_at BIGINT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        error_message TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_outbox_jobs_pending
    ON outbox_jobs(status, job_type, runner_name)
    WHERE status = 'pending'
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_outbox_jobs_scale_window
    ON outbox_jobs(pool_name, (job_params->>'window_start'))
    WHERE job_type = 'scale'
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS instance_utilization_history (
        id BIGSERIAL PRIMARY KEY,
        pool_name TEXT NOT NULL,
        variant_id TEXT NOT NULL,
        in_use_instances INTEGER NOT NULL,
        recorded_at BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_utilization_pool_variant_time
    ON instance_utilization_history(pool_name, variant_id, recorded_at)
    "#,
];

/// Row struct for the `instances` table.
#[derive(FromRow)]
struct InstanceRow {
    instance_id: String,
    instance_name: String,
    instance_node_id: Option<String>,
    instance_address: String,
    instance_provider: String,
    instance_state: String,
    instance_pool: String,
    instance_image: String,
    instance_region: String,
    instance_zone: String,
    instance_size: String,
    instance_os: String,
    instance_arch: String,
    instance_variant: String,
    instance_version: String,
    instance_os_name: String,
    variant_id: String,
    instance_stage: String,
    instance_ca_key: String,
    instance_ca_cert: String,
    instance_tls_key: String,
    instance_tls_cert: String,
    instance_started: i64,
    instance_updated: i64,
    is_hibernated: bool,
    instance_port: i64,
    instance_owner_id: String,
    runner_name: String,
    instance_storage_identifier: String,
    instance_labels: sqlx::types::Json<BTreeMap<String, String>>,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = StateError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        Ok(Instance {
            id: row.instance_id,
            name: row.instance_name,
            node_id: row.instance_node_id,
            pool: row.instance_pool,
            provider: row.instance_provider,
            zone: row.instance_zone,
            region: row.instance_region,
            size: row.instance_size,
            image: row.instance_image,
            platform: Platform {
                os: row.instance_os,
                arch: row.instance_arch,
                variant: row.instance_variant,
                version: row.instance_version,
                os_name: row.instance_os_name,
            },
            variant_id: row.variant_id,
            address: row.instance_address,
            port: u16::try_from(row.instance_port)
                .map_err(|e| StateError::Deserialize(format!("instance_port: {e}")))?,
            ca_cert: row.instance_ca_cert,
            ca_key: row.instance_ca_key,
            tls_cert: row.instance_tls_cert,
            tls_key: row.instance_tls_key,
            state: row.instance_state.parse()?,
            is_hibernated: row.is_hibernated,
            started: row.instance_started,
            updated: row.instance_updated,
            owner_id: row.instance_owner_id,
            stage: row.instance_stage,
            runner_name: row.runner_name,
            storage_identifier: row.instance_storage_identifier,
            labels: row.instance_labels.0,
        })
    }
}

/// Row struct for the `outbox_jobs` table.
#[derive(FromRow)]
struct OutboxJobRow {
    id: i64,
    pool_name: String,
    runner_name: String,
    job_type: String,
    job_params: sqlx::types::Json<serde_json::Value>,
    status: String,
    created_at: i64,
    processed_at: Option<i64>,
    retry_count: i32,
    error_message: Option<String>,
}

impl TryFrom<OutboxJobRow> for OutboxJob {
    type Error = StateError;

    fn try_from(row: OutboxJobRow) -> Result<Self, Self::Error> {
        Ok(OutboxJob {
            id: row.id,
            pool_name: row.pool_name,
            runner_name: row.runner_name,
            job_type: row.job_type.parse()?,
            job_params: row.job_params.0,
            status: row.status.parse()?,
            retry_count: row.retry_count.max(0) as u32,
            error_message: row.error_message,
            created_at: row.created_at,
            processed_at: row.processed_at,
        })
    }
}

#[derive(FromRow)]
struct ReservationRow {
    stage_id: String,
    pool_name: String,
    instance_id: String,
    #[sqlx(rename = "gcp_reservation_id")]
    reservation_id: String,
    zone: String,
    machine_ip: String,
    created_at: i64,
}

impl From<ReservationRow> for CapacityReservation {
    fn from(row: ReservationRow) -> Self {
        CapacityReservation {
            stage_id: row.stage_id,
            pool_name: row.pool_name,
            instance_id: row.instance_id,
            reservation_id: row.reservation_id,
            zone: row.zone,
            machine_ip: row.machine_ip,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct UtilizationRow {
    pool_name: String,
    variant_id: String,
    in_use_instances: i32,
    recorded_at: i64,
}

fn rows_to<R, T>(rows: Vec<R>) -> StateResult<Vec<T>>
where
    T: TryFrom<R, Error = StateError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Key of the one scale job a pool may hold per window.
fn scale_job_key(job: &OutboxJob) -> String {
    format!(
        "scale job for {} at {}",
        job.pool_name,
        job.window_start().unwrap_or_default()
    )
}

fn unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Append `AND …` clauses for every set field of `query`.
fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, query: &InstanceQuery) {
    let columns = [
        ("instance_pool", &query.pool),
        ("instance_id", &query.instance_id),
        ("variant_id", &query.variant_id),
        ("instance_owner_id", &query.owner_id),
        ("instance_stage", &query.stage),
        ("instance_image", &query.image),
        ("instance_size", &query.size),
        ("instance_zone", &query.zone),
        ("instance_os", &query.os),
        ("instance_arch", &query.arch),
    ];
    for (column, value) in columns {
        if let Some(value) = value {
            builder.push(" AND ").push(column).push(" = ");
            builder.push_bind(value.clone());
        }
    }
    if let Some(state) = query.state {
        builder.push(" AND instance_state = ");
        builder.push_bind(state.as_str());
    }
    if let Some(retain) = query.retain {
        builder.push(" AND instance_labels->>'retain' = ");
        builder.push_bind(retain.to_string());
    }
}

/// PostgreSQL implementation of every store interface.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool to `url`.
    pub async fn connect(url: &str, max_connections: u32) -> StateResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        debug!(max_connections, "postgres state store connected");
        Ok(Self { pool })
    }

    /// Create tables and indexes if absent.
    pub async fn run_migrations(&self) -> StateResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl InstanceStore for PgStore {
    async fn find(&self, id: &str) -> StateResult<Option<Instance>> {
        let row = sqlx::query_as::<_, InstanceRow>("SELECT * FROM instances WHERE instance_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Instance::try_from).transpose()
    }

    async fn find_by_name(&self, name: &str) -> StateResult<Option<Instance>> {
        let row =
            sqlx::query_as::<_, InstanceRow>("SELECT * FROM instances WHERE instance_name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Instance::try_from).transpose()
    }

    async fn list(&self, query: &InstanceQuery) -> StateResult<Vec<Instance>> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT * FROM instances WHERE TRUE");
        push_filters(&mut builder, query);
        builder.push(" ORDER BY instance_started ASC, instance_id ASC");
        let rows = builder
            .build_query_as::<InstanceRow>()
            .fetch_all(&self.pool)
            .await?;
        rows_to(rows)
    }

    async fn create(&self, instance: &Instance) -> StateResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO instances (
                instance_id, instance_name, instance_node_id, instance_address,
                instance_provider, instance_state, instance_pool, instance_image,
                instance_region, instance_zone, instance_size, instance_os,
                instance_arch, instance_variant, instance_version, instance_os_name,
                variant_id, instance_stage, instance_ca_key, instance_ca_cert,
                instance_tls_key, instance_tls_cert, instance_started, instance_updated,
                is_hibernated, instance_port, instance_owner_id, runner_name,
                instance_storage_identifier, instance_labels
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30
            )
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.name)
        .bind(&instance.node_id)
        .bind(&instance.address)
        .bind(&instance.provider)
        .bind(instance.state.as_str())
        .bind(&instance.pool)
        .bind(&instance.image)
        .bind(&instance.region)
        .bind(&instance.zone)
        .bind(&instance.size)
        .bind(&instance.platform.os)
        .bind(&instance.platform.arch)
        .bind(&instance.platform.variant)
        .bind(&instance.platform.version)
        .bind(&instance.platform.os_name)
        .bind(&instance.variant_id)
        .bind(&instance.stage)
        .bind(&instance.ca_key)
        .bind(&instance.ca_cert)
        .bind(&instance.tls_key)
        .bind(&instance.tls_cert)
        .bind(instance.started)
        .bind(instance.updated)
        .bind(instance.is_hibernated)
        .bind(i64::from(instance.port))
        .bind(&instance.owner_id)
        .bind(&instance.runner_name)
        .bind(&instance.storage_identifier)
        .bind(sqlx::types::Json(&instance.labels))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(instance = %instance.id, pool = %instance.pool, "instance stored");
                Ok(())
            }
            Err(e) if unique_violation(&e) => Err(StateError::AlreadyExists(instance.id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, instance: &Instance) -> StateResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE instances SET
                instance_name = $2, instance_node_id = $3, instance_address = $4,
                instance_state = $5, instance_zone = $6, instance_stage = $7,
                instance_started = $8, instance_updated = $9, is_hibernated = $10,
                instance_owner_id = $11, instance_storage_identifier = $12,
                instance_labels = $13, instance_port = $14
            WHERE instance_id = $1
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.name)
        .bind(&instance.node_id)
        .bind(&instance.address)
        .bind(instance.state.as_str())
        .bind(&instance.zone)
        .bind(&instance.stage)
        .bind(instance.started)
        .bind(instance.updated)
        .bind(instance.is_hibernated)
        .bind(&instance.owner_id)
        .bind(&instance.storage_identifier)
        .bind(sqlx::types::Json(&instance.labels))
        .bind(i64::from(instance.port))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StateError::NotFound(instance.id.clone()));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> StateResult<bool> {
        let result = sqlx::query("DELETE FROM instances WHERE instance_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_and_claim(
        &self,
        query: &InstanceQuery,
        new_state: InstanceState,
        allowed: &[InstanceState],
        update_start_time: bool,
    ) -> StateResult<Instance> {
        let now = epoch_secs();
        let allowed: Vec<String> = allowed.iter().map(|s| s.as_str().to_string()).collect();

        let mut builder = QueryBuilder::<Postgres>::new(
            "WITH candidate AS (SELECT instance_id FROM instances WHERE TRUE",
        );
        push_filters(&mut builder, query);
        builder.push(" AND instance_state = ANY(");
        builder.push_bind(allowed);
        builder.push(
            ") ORDER BY instance_started ASC, instance_id ASC LIMIT 1 FOR UPDATE SKIP LOCKED) \
             UPDATE instances SET instance_state = ",
        );
        builder.push_bind(new_state.as_str());
        builder.push(", instance_updated = ");
        builder.push_bind(now);
        if update_start_time {
            builder.push(", instance_started = ");
            builder.push_bind(now);
        }
        builder.push(
            " FROM candidate WHERE instances.instance_id = candidate.instance_id \
             RETURNING instances.*",
        );

        let row = builder
            .build_query_as::<InstanceRow>()
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Instance::try_from(row),
            None => Err(StateError::NoRows),
        }
    }

    async fn patch(
        &self,
        id: &str,
        expected: &[InstanceState],
        patch: &InstancePatch,
    ) -> StateResult<Option<Instance>> {
        let expected: Vec<String> = expected.iter().map(|s| s.as_str().to_string()).collect();
        let row = sqlx::query_as::<_, InstanceRow>(
            r#"
            UPDATE instances SET
                instance_state = COALESCE($3, instance_state),
                is_hibernated = COALESCE($4, is_hibernated),
                instance_address = COALESCE($5, instance_address),
                instance_owner_id = COALESCE($6, instance_owner_id),
                instance_stage = COALESCE($7, instance_stage),
                instance_started = COALESCE($8, instance_started),
                instance_labels = instance_labels || $9,
                instance_updated = $10
            WHERE instance_id = $1
              AND (cardinality($2::text[]) = 0 OR instance_state = ANY($2))
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(expected)
        .bind(patch.state.map(|s| s.as_str()))
        .bind(patch.is_hibernated)
        .bind(&patch.address)
        .bind(&patch.owner_id)
        .bind(&patch.stage)
        .bind(patch.started)
        .bind(sqlx::types::Json(&patch.labels))
        .bind(patch.updated)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Instance::try_from).transpose()
    }

    async fn mark_for_purge(
        &self,
        pool: &str,
        criteria: &PurgeCriteria,
        now: i64,
    ) -> StateResult<Vec<Instance>> {
        let rows = sqlx::query_as::<_, InstanceRow>(
            r#"
            UPDATE instances
            SET instance_state = 'terminating', instance_updated = $2
            WHERE instance_pool = $1
              AND instance_labels->>'retain' = 'false'
              AND (
                (instance_state = 'inuse' AND NOT jsonb_exists(instance_labels, 'ttl')
                    AND instance_started < $3)
                OR (instance_state = 'inuse' AND jsonb_exists(instance_labels, 'ttl')
                    AND instance_started < $4)
                OR (instance_state IN ('created', 'hibernating') AND instance_started < $5)
                OR (instance_state = 'terminating' AND instance_updated < $6)
              )
            RETURNING *
            "#,
        )
        .bind(pool)
        .bind(now)
        .bind(criteria.busy_before)
        .bind(criteria.ttl_busy_before)
        .bind(criteria.free_before)
        .bind(criteria.terminating_before)
        .fetch_all(&self.pool)
        .await?;
        rows_to(rows)
    }

    async fn count_by_pool_and_variant(
        &self,
        state: InstanceState,
    ) -> StateResult<Vec<PoolVariantCount>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            r#"
            SELECT instance_pool, variant_id, COUNT(*)
            FROM instances
            WHERE instance_state = $1
            GROUP BY instance_pool, variant_id
            ORDER BY instance_pool, variant_id
            "#,
        )
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(pool, variant_id, count)| PoolVariantCount {
                pool,
                variant_id,
                count: count.max(0) as u32,
            })
            .collect())
    }
}

#[async_trait]
impl StageOwnerStore for PgStore {
    async fn create(&self, owner: &StageOwner) -> StateResult<bool> {
        let result = sqlx::query(
            "INSERT INTO stage_owner (stage_id, pool_name) VALUES ($1, $2) \
             ON CONFLICT (stage_id) DO NOTHING",
        )
        .bind(&owner.stage_id)
        .bind(&owner.pool_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find(&self, stage_id: &str) -> StateResult<Option<StageOwner>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT stage_id, pool_name FROM stage_owner WHERE stage_id = $1")
                .bind(stage_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(stage_id, pool_name)| StageOwner {
            stage_id,
            pool_name,
        }))
    }

    async fn delete(&self, stage_id: &str) -> StateResult<bool> {
        let result = sqlx::query("DELETE FROM stage_owner WHERE stage_id = $1")
            .bind(stage_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl CapacityReservationStore for PgStore {
    async fn create(&self, reservation: &CapacityReservation) -> StateResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO capacity_reservation
                (stage_id, pool_name, instance_id, machine_ip, gcp_reservation_id, zone, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&reservation.stage_id)
        .bind(&reservation.pool_name)
        .bind(&reservation.instance_id)
        .bind(&reservation.machine_ip)
        .bind(&reservation.reservation_id)
        .bind(&reservation.zone)
        .bind(reservation.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if unique_violation(&e) => {
                Err(StateError::AlreadyExists(reservation.stage_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find(&self, stage_id: &str) -> StateResult<Option<CapacityReservation>> {
        let row = sqlx::query_as::<_, ReservationRow>(
            "SELECT * FROM capacity_reservation WHERE stage_id = $1",
        )
        .bind(stage_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(CapacityReservation::from))
    }

    async fn update(&self, reservation: &CapacityReservation) -> StateResult<()> {
        sqlx::query(
            r#"
            UPDATE capacity_reservation
            SET instance_id = $2, machine_ip = $3, zone = $4
            WHERE stage_id = $1
            "#,
        )
        .bind(&reservation.stage_id)
        .bind(&reservation.instance_id)
        .bind(&reservation.machine_ip)
        .bind(&reservation.zone)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, stage_id: &str) -> StateResult<bool> {
        let result = sqlx::query("DELETE FROM capacity_reservation WHERE stage_id = $1")
            .bind(stage_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_unconsumed_older_than(
        &self,
        before: i64,
    ) -> StateResult<Vec<CapacityReservation>> {
        let rows = sqlx::query_as::<_, ReservationRow>(
            "SELECT * FROM capacity_reservation WHERE instance_id = '' AND created_at < $1",
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(CapacityReservation::from).collect())
    }
}

#[async_trait]
impl OutboxStore for PgStore {
    async fn create(&self, job: &OutboxJob) -> StateResult<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO outbox_jobs
                (pool_name, runner_name, job_type, job_params, status, created_at, retry_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(&job.pool_name)
        .bind(&job.runner_name)
        .bind(job.job_type.as_str())
        .bind(sqlx::types::Json(&job.job_params))
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.retry_count as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if unique_violation(&e) {
                StateError::AlreadyExists(scale_job_key(job))
            } else {
                e.into()
            }
        })?;
        debug!(job_id = id, pool = %job.pool_name, job_type = %job.job_type, "outbox job stored");
        Ok(id)
    }

    async fn find_and_claim_pending(
        &self,
        runner_name: &str,
        job_types: &[OutboxJobType],
        batch_size: usize,
        retry_interval: Duration,
        now: i64,
    ) -> StateResult<Vec<OutboxJob>> {
        let types: Vec<String> = job_types.iter().map(|t| t.as_str().to_string()).collect();
        let retry_before = now - retry_interval.as_secs() as i64;

        let rows = sqlx::query_as::<_, OutboxJobRow>(
            r#"
            WITH claimable AS (
                SELECT id FROM outbox_jobs
                WHERE (runner_name = $1 OR runner_name = '')
                  AND status = 'pending'
                  AND job_type = ANY($2)
                  AND (processed_at IS NULL OR processed_at < $3)
                ORDER BY id ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_jobs
            SET status = 'running', retry_count = outbox_jobs.retry_count + 1, processed_at = $5
            FROM claimable
            WHERE outbox_jobs.id = claimable.id
            RETURNING outbox_jobs.*
            "#,
        )
        .bind(runner_name)
        .bind(types)
        .bind(retry_before)
        .bind(batch_size as i64)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs: Vec<OutboxJob> = rows_to(rows)?;
        jobs.sort_by_key(|job| job.id);
        Ok(jobs)
    }

    async fn release_with_error(&self, id: i64, error: &str) -> StateResult<()> {
        let result = sqlx::query(
            "UPDATE outbox_jobs SET status = 'pending', error_message = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StateError::NotFound(format!("outbox job {id}")));
        }
        Ok(())
    }

    async fn delete(&self, id: i64) -> StateResult<bool> {
        let result = sqlx::query("DELETE FROM outbox_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_older_than(&self, before: i64) -> StateResult<u64> {
        let result = sqlx::query("DELETE FROM outbox_jobs WHERE created_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn find_scale_job_for_window(
        &self,
        pool: &str,
        window_start: i64,
    ) -> StateResult<Option<OutboxJob>> {
        let row = sqlx::query_as::<_, OutboxJobRow>(
            r#"
            SELECT * FROM outbox_jobs
            WHERE pool_name = $1
              AND job_type = 'scale'
              AND (job_params->>'window_start')::BIGINT = $2
            LIMIT 1
            "#,
        )
        .bind(pool)
        .bind(window_start)
        .fetch_optional(&self.pool)
        .await?;
        row.map(OutboxJob::try_from).transpose()
    }

    async fn list(&self, pool: &str, job_type: Option<OutboxJobType>) -> StateResult<Vec<OutboxJob>> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT * FROM outbox_jobs WHERE pool_name = ");
        builder.push_bind(pool.to_string());
        if let Some(job_type) = job_type {
            builder.push(" AND job_type = ");
            builder.push_bind(job_type.as_str());
        }
        builder.push(" ORDER BY id ASC");
        let rows = builder
            .build_query_as::<OutboxJobRow>()
            .fetch_all(&self.pool)
            .await?;
        rows_to(rows)
    }
}

#[async_trait]
impl UtilizationHistoryStore for PgStore {
    async fn create(&self, record: &UtilizationRecord) -> StateResult<()> {
        sqlx::query(
            r#"
            INSERT INTO instance_utilization_history
                (pool_name, variant_id, in_use_instances, recorded_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&record.pool_name)
        .bind(&record.variant_id)
        .bind(record.in_use_instances as i32)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn range(
        &self,
        pool: &str,
        variant_id: &str,
        start: i64,
        end: i64,
    ) -> StateResult<Vec<UtilizationRecord>> {
        let rows = sqlx::query_as::<_, UtilizationRow>(
            r#"
            SELECT pool_name, variant_id, in_use_instances, recorded_at
            FROM instance_utilization_history
            WHERE pool_name = $1 AND variant_id = $2
              AND recorded_at >= $3 AND recorded_at <= $4
            ORDER BY recorded_at ASC
            "#,
        )
        .bind(pool)
        .bind(variant_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| UtilizationRecord {
                pool_name: row.pool_name,
                variant_id: row.variant_id,
                in_use_instances: row.in_use_instances.max(0) as u32,
                recorded_at: row.recorded_at,
            })
            .collect())
    }

    async fn delete_older_than(&self, before: i64) -> StateResult<u64> {
        let result = sqlx::query("DELETE FROM instance_utilization_history WHERE recorded_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
