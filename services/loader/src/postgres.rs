//! PostgreSQL implementation of the warehouse.

use crate::config::WarehouseConfig;
use crate::record::TelemetryRecord;
use crate::warehouse::{LoadManifest, LoadReceipt, Warehouse, WarehouseError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use etl_pipeline::ObjectId;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, QueryBuilder};
use tracing::{debug, info, instrument, warn};

/// Rows per multi-value INSERT; keeps bind parameters well under the
/// protocol limit of 65535
const INSERT_CHUNK: usize = 1000;

#[derive(Debug, FromRow)]
struct ManifestRow {
    object_id: String,
    content_sha256: String,
    row_count: i64,
    loaded_at: DateTime<Utc>,
    duplicate_attempts: i32,
}

impl ManifestRow {
    fn into_manifest(self) -> Result<LoadManifest, WarehouseError> {
        let object_id = self
            .object_id
            .parse()
            .map_err(|e| WarehouseError::Rejected(format!("corrupt manifest row: {}", e)))?;
        Ok(LoadManifest {
            object_id,
            content_sha256: self.content_sha256,
            row_count: self.row_count.max(0) as u64,
            loaded_at: self.loaded_at,
            duplicate_attempts: self.duplicate_attempts.max(0) as u32,
        })
    }
}

/// Warehouse backed by a PostgreSQL schema
pub struct PgWarehouse {
    pool: PgPool,
    dataset: String,
    rows_table: String,
    manifest_table: String,
}

impl PgWarehouse {
    /// Connect a pool. Identifiers in `config` must already be validated.
    pub async fn connect(config: &WarehouseConfig) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .connect(&config.url)
            .await
            .map_err(|e| classify(e, "connect"))?;

        info!(
            dataset = %config.dataset,
            table = %config.table,
            "Connected to PostgreSQL warehouse"
        );

        Ok(Self::with_pool(pool, config))
    }

    pub fn with_pool(pool: PgPool, config: &WarehouseConfig) -> Self {
        Self {
            pool,
            dataset: config.dataset.clone(),
            rows_table: format!("{}.{}", config.dataset, config.table),
            manifest_table: format!("{}.{}", config.dataset, config.manifest_table()),
        }
    }

    /// Create the schema and both tables if they do not exist
    pub async fn ensure_schema(&self) -> Result<(), WarehouseError> {
        info!(dataset = %self.dataset, "Ensuring warehouse schema");

        for statement in schema_statements(&self.dataset, &self.rows_table, &self.manifest_table) {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| classify(e, "create schema"))?;
        }
        Ok(())
    }
}

fn schema_statements(dataset: &str, rows_table: &str, manifest_table: &str) -> Vec<String> {
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS {}", dataset),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                object_id TEXT NOT NULL,
                line BIGINT NOT NULL,
                recorded_at TIMESTAMP NOT NULL,
                serial_number TEXT NOT NULL,
                gps_longitude DOUBLE PRECISION NOT NULL,
                gps_latitude DOUBLE PRECISION NOT NULL,
                location TEXT NOT NULL,
                working_hours DOUBLE PRECISION NOT NULL,
                engine_rpm DOUBLE PRECISION NOT NULL,
                engine_load DOUBLE PRECISION NOT NULL,
                fuel_consumption DOUBLE PRECISION NOT NULL,
                speed_gearbox DOUBLE PRECISION NOT NULL,
                speed_radar DOUBLE PRECISION NOT NULL,
                motor_temperature DOUBLE PRECISION NOT NULL,
                front_pto_rpm DOUBLE PRECISION NOT NULL,
                rear_pto_rpm DOUBLE PRECISION NOT NULL,
                gear_shift TEXT NOT NULL,
                ambient_temperature DOUBLE PRECISION NOT NULL,
                parking_brake_status TEXT NOT NULL,
                differential_lock_status TEXT NOT NULL,
                all_wheel_status TEXT NOT NULL,
                creeper_status TEXT NOT NULL,
                PRIMARY KEY (object_id, line)
            )
            "#,
            rows_table
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                object_id TEXT PRIMARY KEY,
                content_sha256 TEXT NOT NULL,
                row_count BIGINT NOT NULL,
                loaded_at TIMESTAMPTZ NOT NULL,
                duplicate_attempts INTEGER NOT NULL DEFAULT 0
            )
            "#,
            manifest_table
        ),
    ]
}

/// Connection loss, pool exhaustion, serialization conflicts and server
/// shutdown are transient; constraint and syntax errors are not
fn classify(err: sqlx::Error, action: &str) -> WarehouseError {
    let message = format!("{}: {}", action, err);

    match &err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::WorkerCrashed => WarehouseError::Unavailable(message),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(code) if is_transient_sqlstate(code) => WarehouseError::Unavailable(message),
            _ => WarehouseError::Rejected(message),
        },
        _ => WarehouseError::Rejected(message),
    }
}

fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || code.starts_with("53")
        || matches!(code, "40001" | "40P01" | "57P01" | "57014")
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn manifest(&self, object_id: &ObjectId) -> Result<Option<LoadManifest>, WarehouseError> {
        let row = sqlx::query_as::<_, ManifestRow>(&format!(
            r#"
            SELECT object_id, content_sha256, row_count, loaded_at, duplicate_attempts
            FROM {}
            WHERE object_id = $1
            "#,
            self.manifest_table
        ))
        .bind(object_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify(e, "read manifest"))?;

        row.map(ManifestRow::into_manifest).transpose()
    }

    #[instrument(skip(self, content_sha256, records), fields(object_id = %object_id, rows = records.len()))]
    async fn load(
        &self,
        object_id: &ObjectId,
        content_sha256: &str,
        records: &[TelemetryRecord],
    ) -> Result<LoadReceipt, WarehouseError> {
        let id = object_id.to_string();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify(e, "begin transaction"))?;

        // Concurrent loads of one object queue here until the holder commits
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(e, "lock object"))?;

        let committed: Option<String> = sqlx::query_scalar(&format!(
            "SELECT content_sha256 FROM {} WHERE object_id = $1",
            self.manifest_table
        ))
        .bind(&id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| classify(e, "recheck manifest"))?;

        if committed.as_deref() == Some(content_sha256) {
            sqlx::query(&format!(
                "UPDATE {} SET duplicate_attempts = duplicate_attempts + 1 WHERE object_id = $1",
                self.manifest_table
            ))
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(e, "record duplicate"))?;

            tx.commit()
                .await
                .map_err(|e| classify(e, "commit transaction"))?;

            info!("Same content committed by a concurrent load, nothing written");
            return Ok(LoadReceipt::duplicate());
        }

        let replaced = sqlx::query(&format!("DELETE FROM {} WHERE object_id = $1", self.rows_table))
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(e, "delete previous rows"))?
            .rows_affected();

        if replaced > 0 {
            warn!(rows_replaced = replaced, "Replacing rows from an earlier load");
        }

        for chunk in records.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} (object_id, line, recorded_at, serial_number, gps_longitude, \
                 gps_latitude, location, working_hours, engine_rpm, engine_load, fuel_consumption, \
                 speed_gearbox, speed_radar, motor_temperature, front_pto_rpm, rear_pto_rpm, \
                 gear_shift, ambient_temperature, parking_brake_status, differential_lock_status, \
                 all_wheel_status, creeper_status) ",
                self.rows_table
            ));

            builder.push_values(chunk, |mut row, r| {
                row.push_bind(&id)
                    .push_bind(r.line as i64)
                    .push_bind(r.recorded_at)
                    .push_bind(&r.serial_number)
                    .push_bind(r.gps_longitude)
                    .push_bind(r.gps_latitude)
                    .push_bind(r.location())
                    .push_bind(r.working_hours)
                    .push_bind(r.engine_rpm)
                    .push_bind(r.engine_load)
                    .push_bind(r.fuel_consumption)
                    .push_bind(r.speed_gearbox)
                    .push_bind(r.speed_radar)
                    .push_bind(r.motor_temperature)
                    .push_bind(r.front_pto_rpm)
                    .push_bind(r.rear_pto_rpm)
                    .push_bind(&r.gear_shift)
                    .push_bind(r.ambient_temperature)
                    .push_bind(&r.parking_brake_status)
                    .push_bind(&r.differential_lock_status)
                    .push_bind(&r.all_wheel_status)
                    .push_bind(&r.creeper_status);
            });

            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| classify(e, "insert rows"))?;
        }

        sqlx::query(&format!(
            r#"
            INSERT INTO {} (object_id, content_sha256, row_count, loaded_at, duplicate_attempts)
            VALUES ($1, $2, $3, NOW(), 0)
            ON CONFLICT (object_id) DO UPDATE SET
                content_sha256 = EXCLUDED.content_sha256,
                row_count = EXCLUDED.row_count,
                loaded_at = EXCLUDED.loaded_at
            "#,
            self.manifest_table
        ))
        .bind(&id)
        .bind(content_sha256)
        .bind(records.len() as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| classify(e, "upsert manifest"))?;

        tx.commit()
            .await
            .map_err(|e| classify(e, "commit transaction"))?;

        debug!("Warehouse load committed");

        Ok(LoadReceipt {
            rows_written: records.len() as u64,
            rows_replaced: replaced,
            already_loaded: false,
        })
    }

    async fn note_duplicate(&self, object_id: &ObjectId) -> Result<(), WarehouseError> {
        sqlx::query(&format!(
            "UPDATE {} SET duplicate_attempts = duplicate_attempts + 1 WHERE object_id = $1",
            self.manifest_table
        ))
        .bind(object_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, "record duplicate"))?;
        Ok(())
    }
}
