//! PostgreSQL Repository Implementations
//!
//! Production persistence using PostgreSQL with the async SQLx driver. Each
//! aggregate is stored as a JSONB document next to the scalar columns the
//! queries filter on; the scalar columns are rewritten on every update so
//! they never drift from the document.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, Row};
use std::sync::Arc;
use stratus_core::{
    Instance, InstanceId, Operation, OperationId, Orchestration, OrchestrationId, RuntimeId,
    RuntimeState,
};
use stratus_ports::{
    InstanceRepository, OperationRepository, OrchestrationRepository, RuntimeStateRepository,
    StoreError,
};
use tracing::{debug, info};

/// Open a connection pool against `database_url`.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<Pool<Postgres>, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| StoreError::Database(format!("Failed to connect to PostgreSQL: {}", e)))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value)
        .map_err(|e| StoreError::Corrupt(format!("Failed to serialize record: {}", e)))
}

fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(value)
        .map_err(|e| StoreError::Corrupt(format!("Failed to deserialize record: {}", e)))
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

/// PostgreSQL-backed operation repository
pub struct PostgresOperationStore {
    pool: Arc<Pool<Postgres>>,
}

impl PostgresOperationStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Initialize database schema.
    ///
    /// The partial unique index on `instance_id` is what makes the
    /// one-unfinished-operation-per-instance rule hold under concurrent
    /// inserts.
    pub async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS operations (
                id UUID PRIMARY KEY,
                instance_id TEXT NOT NULL,
                orchestration_id UUID,
                status TEXT NOT NULL,
                claimed_by TEXT,
                claimed_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| StoreError::Database(format!("Failed to create operations table: {}", e)))?;

        let index_queries = vec![
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_operations_instance_active \
             ON operations(instance_id) WHERE status IN ('pending', 'in_progress')",
            "CREATE INDEX IF NOT EXISTS idx_operations_instance ON operations(instance_id)",
            "CREATE INDEX IF NOT EXISTS idx_operations_orchestration \
             ON operations(orchestration_id) WHERE orchestration_id IS NOT NULL",
            "CREATE INDEX IF NOT EXISTS idx_operations_status ON operations(status)",
        ];
        for query in index_queries {
            sqlx::query(query)
                .execute(&*self.pool)
                .await
                .map_err(|e| StoreError::Database(format!("Failed to create index: {}", e)))?;
        }

        info!("PostgreSQL operation repository initialized");
        Ok(())
    }

    fn row_to_operation(row: sqlx::postgres::PgRow) -> Result<Operation, StoreError> {
        let data: serde_json::Value = row.get("data");
        decode(data)
    }
}

#[async_trait]
impl OperationRepository for PostgresOperationStore {
    async fn insert(&self, operation: &Operation) -> Result<(), StoreError> {
        let query = r#"
            INSERT INTO operations (
                id, instance_id, orchestration_id, status, claimed_by, claimed_at,
                created_at, data
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#;

        sqlx::query(query)
            .bind(operation.id.as_uuid())
            .bind(operation.instance_id.as_str())
            .bind(operation.orchestration_id.map(|o| *o.as_uuid()))
            .bind(operation.status.as_str())
            .bind(operation.claimed_by.as_deref())
            .bind(operation.claimed_at)
            .bind(operation.created_at)
            .bind(encode(operation)?)
            .execute(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Conflict(format!(
                        "instance {} already has an unfinished operation",
                        operation.instance_id
                    ))
                } else {
                    StoreError::Database(format!("Failed to insert operation: {}", e))
                }
            })?;

        debug!("Inserted operation {} into PostgreSQL", operation.id);
        Ok(())
    }

    async fn update(&self, operation: &Operation) -> Result<(), StoreError> {
        let query = r#"
            UPDATE operations
            SET status = $1, claimed_by = $2, claimed_at = $3, data = $4
            WHERE id = $5
        "#;

        let result = sqlx::query(query)
            .bind(operation.status.as_str())
            .bind(operation.claimed_by.as_deref())
            .bind(operation.claimed_at)
            .bind(encode(operation)?)
            .bind(operation.id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to update operation: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::OperationNotFound(operation.id));
        }
        Ok(())
    }

    async fn get(&self, id: &OperationId) -> Result<Option<Operation>, StoreError> {
        let row = sqlx::query("SELECT data FROM operations WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to fetch operation: {}", e)))?;

        row.map(Self::row_to_operation).transpose()
    }

    async fn list_by_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Vec<Operation>, StoreError> {
        let rows =
            sqlx::query("SELECT data FROM operations WHERE instance_id = $1 ORDER BY created_at")
                .bind(instance_id.as_str())
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| {
                    StoreError::Database(format!("Failed to fetch instance operations: {}", e))
                })?;

        rows.into_iter().map(Self::row_to_operation).collect()
    }

    async fn list_by_orchestration(
        &self,
        orchestration_id: &OrchestrationId,
    ) -> Result<Vec<Operation>, StoreError> {
        let rows = sqlx::query(
            "SELECT data FROM operations WHERE orchestration_id = $1 ORDER BY created_at",
        )
        .bind(orchestration_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| {
            StoreError::Database(format!("Failed to fetch orchestration operations: {}", e))
        })?;

        rows.into_iter().map(Self::row_to_operation).collect()
    }

    async fn list_unfinished(&self) -> Result<Vec<Operation>, StoreError> {
        let rows = sqlx::query(
            "SELECT data FROM operations WHERE status IN ('pending', 'in_progress') \
             ORDER BY created_at",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| {
            StoreError::Database(format!("Failed to fetch unfinished operations: {}", e))
        })?;

        rows.into_iter().map(Self::row_to_operation).collect()
    }

    async fn claim(
        &self,
        id: &OperationId,
        owner: &str,
        stale_after: Duration,
    ) -> Result<Option<Operation>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(format!("Failed to begin claim: {}", e)))?;

        let row = sqlx::query("SELECT data FROM operations WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to lock operation: {}", e)))?
            .ok_or(StoreError::OperationNotFound(*id))?;

        let mut operation = Self::row_to_operation(row)?;

        let now = Utc::now();
        let takeover = match (&operation.claimed_by, operation.claimed_at) {
            (None, _) => true,
            (Some(current), _) if current == owner => true,
            (Some(_), Some(at)) => at + stale_after < now,
            // claim without a timestamp is treated as abandoned
            (Some(_), None) => true,
        };
        if !takeover {
            tx.rollback()
                .await
                .map_err(|e| StoreError::Database(format!("Failed to roll back claim: {}", e)))?;
            return Ok(None);
        }

        operation.claimed_by = Some(owner.to_string());
        operation.claimed_at = Some(now);

        sqlx::query(
            "UPDATE operations SET claimed_by = $1, claimed_at = $2, data = $3 WHERE id = $4",
        )
        .bind(owner)
        .bind(now)
        .bind(encode(&operation)?)
        .bind(id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(format!("Failed to write claim: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(format!("Failed to commit claim: {}", e)))?;

        Ok(Some(operation))
    }

    async fn release(&self, id: &OperationId, owner: &str) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(format!("Failed to begin release: {}", e)))?;

        let row = sqlx::query("SELECT data FROM operations WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to lock operation: {}", e)))?
            .ok_or(StoreError::OperationNotFound(*id))?;

        let mut operation = Self::row_to_operation(row)?;
        if operation.claimed_by.as_deref() != Some(owner) {
            tx.rollback()
                .await
                .map_err(|e| StoreError::Database(format!("Failed to roll back release: {}", e)))?;
            return Ok(());
        }

        operation.claimed_by = None;
        operation.claimed_at = None;

        sqlx::query(
            "UPDATE operations SET claimed_by = NULL, claimed_at = NULL, data = $1 WHERE id = $2",
        )
        .bind(encode(&operation)?)
        .bind(id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(format!("Failed to write release: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(format!("Failed to commit release: {}", e)))?;
        Ok(())
    }
}

/// PostgreSQL-backed instance repository
pub struct PostgresInstanceStore {
    pool: Arc<Pool<Postgres>>,
}

impl PostgresInstanceStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Initialize database schema.
    pub async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                runtime_id UUID NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                provisioned_at TIMESTAMPTZ,
                deprovisioned_at TIMESTAMPTZ,
                data JSONB NOT NULL
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| StoreError::Database(format!("Failed to create instances table: {}", e)))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_instances_runtime ON instances(runtime_id)")
            .execute(&*self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to create index: {}", e)))?;

        info!("PostgreSQL instance repository initialized");
        Ok(())
    }

    fn row_to_instance(row: sqlx::postgres::PgRow) -> Result<Instance, StoreError> {
        let data: serde_json::Value = row.get("data");
        decode(data)
    }
}

#[async_trait]
impl InstanceRepository for PostgresInstanceStore {
    async fn insert(&self, instance: &Instance) -> Result<(), StoreError> {
        let query = r#"
            INSERT INTO instances (
                instance_id, runtime_id, created_at, provisioned_at, deprovisioned_at, data
            ) VALUES ($1, $2, $3, $4, $5, $6)
        "#;

        sqlx::query(query)
            .bind(instance.instance_id.as_str())
            .bind(instance.runtime_id.as_uuid())
            .bind(instance.created_at)
            .bind(instance.provisioned_at)
            .bind(instance.deprovisioned_at)
            .bind(encode(instance)?)
            .execute(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Conflict(format!(
                        "instance {} already exists",
                        instance.instance_id
                    ))
                } else {
                    StoreError::Database(format!("Failed to insert instance: {}", e))
                }
            })?;
        Ok(())
    }

    async fn update(&self, instance: &Instance) -> Result<(), StoreError> {
        let query = r#"
            UPDATE instances
            SET runtime_id = $1, provisioned_at = $2, deprovisioned_at = $3, data = $4
            WHERE instance_id = $5
        "#;

        let result = sqlx::query(query)
            .bind(instance.runtime_id.as_uuid())
            .bind(instance.provisioned_at)
            .bind(instance.deprovisioned_at)
            .bind(encode(instance)?)
            .bind(instance.instance_id.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to update instance: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InstanceNotFound(instance.instance_id.clone()));
        }
        Ok(())
    }

    async fn get(&self, id: &InstanceId) -> Result<Option<Instance>, StoreError> {
        let row = sqlx::query("SELECT data FROM instances WHERE instance_id = $1")
            .bind(id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to fetch instance: {}", e)))?;

        row.map(Self::row_to_instance).transpose()
    }

    async fn get_by_runtime(
        &self,
        runtime_id: &RuntimeId,
    ) -> Result<Option<Instance>, StoreError> {
        let row = sqlx::query("SELECT data FROM instances WHERE runtime_id = $1")
            .bind(runtime_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to fetch instance: {}", e)))?;

        row.map(Self::row_to_instance).transpose()
    }

    async fn list(&self) -> Result<Vec<Instance>, StoreError> {
        let rows = sqlx::query("SELECT data FROM instances ORDER BY created_at")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to fetch instances: {}", e)))?;

        rows.into_iter().map(Self::row_to_instance).collect()
    }

    async fn list_active(&self) -> Result<Vec<Instance>, StoreError> {
        let rows = sqlx::query(
            "SELECT data FROM instances \
             WHERE provisioned_at IS NOT NULL AND deprovisioned_at IS NULL \
             ORDER BY created_at",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| StoreError::Database(format!("Failed to fetch active instances: {}", e)))?;

        rows.into_iter().map(Self::row_to_instance).collect()
    }
}

/// PostgreSQL-backed runtime state repository
///
/// Append-only. The BIGSERIAL `seq` column orders snapshots within a runtime
/// even when two land inside the same timestamp tick.
pub struct PostgresRuntimeStateStore {
    pool: Arc<Pool<Postgres>>,
}

impl PostgresRuntimeStateStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Initialize database schema.
    pub async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runtime_states (
                seq BIGSERIAL PRIMARY KEY,
                id UUID NOT NULL UNIQUE,
                runtime_id UUID NOT NULL,
                operation_id UUID NOT NULL UNIQUE,
                created_at TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            StoreError::Database(format!("Failed to create runtime_states table: {}", e))
        })?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_runtime_states_runtime ON runtime_states(runtime_id)",
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| StoreError::Database(format!("Failed to create index: {}", e)))?;

        info!("PostgreSQL runtime state repository initialized");
        Ok(())
    }

    fn row_to_state(row: sqlx::postgres::PgRow) -> Result<RuntimeState, StoreError> {
        let data: serde_json::Value = row.get("data");
        decode(data)
    }
}

#[async_trait]
impl RuntimeStateRepository for PostgresRuntimeStateStore {
    async fn insert(&self, state: &RuntimeState) -> Result<(), StoreError> {
        let query = r#"
            INSERT INTO runtime_states (id, runtime_id, operation_id, created_at, data)
            VALUES ($1, $2, $3, $4, $5)
        "#;

        sqlx::query(query)
            .bind(state.id.as_uuid())
            .bind(state.runtime_id.as_uuid())
            .bind(state.operation_id.as_uuid())
            .bind(state.created_at)
            .bind(encode(state)?)
            .execute(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Conflict(format!(
                        "runtime state for operation {} already recorded",
                        state.operation_id
                    ))
                } else {
                    StoreError::Database(format!("Failed to insert runtime state: {}", e))
                }
            })?;
        Ok(())
    }

    async fn get_latest_by_runtime(
        &self,
        runtime_id: &RuntimeId,
    ) -> Result<Option<RuntimeState>, StoreError> {
        let row = sqlx::query(
            "SELECT data FROM runtime_states WHERE runtime_id = $1 ORDER BY seq DESC LIMIT 1",
        )
        .bind(runtime_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| StoreError::Database(format!("Failed to fetch runtime state: {}", e)))?;

        row.map(Self::row_to_state).transpose()
    }

    async fn list_by_runtime(
        &self,
        runtime_id: &RuntimeId,
    ) -> Result<Vec<RuntimeState>, StoreError> {
        let rows =
            sqlx::query("SELECT data FROM runtime_states WHERE runtime_id = $1 ORDER BY seq DESC")
                .bind(runtime_id.as_uuid())
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| {
                    StoreError::Database(format!("Failed to fetch runtime states: {}", e))
                })?;

        rows.into_iter().map(Self::row_to_state).collect()
    }

    async fn get_by_operation(
        &self,
        operation_id: &OperationId,
    ) -> Result<Option<RuntimeState>, StoreError> {
        let row = sqlx::query("SELECT data FROM runtime_states WHERE operation_id = $1")
            .bind(operation_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to fetch runtime state: {}", e)))?;

        row.map(Self::row_to_state).transpose()
    }
}

/// PostgreSQL-backed orchestration repository
pub struct PostgresOrchestrationStore {
    pool: Arc<Pool<Postgres>>,
}

impl PostgresOrchestrationStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Initialize database schema.
    pub async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orchestrations (
                id UUID PRIMARY KEY,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            StoreError::Database(format!("Failed to create orchestrations table: {}", e))
        })?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_orchestrations_status ON orchestrations(status)",
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| StoreError::Database(format!("Failed to create index: {}", e)))?;

        info!("PostgreSQL orchestration repository initialized");
        Ok(())
    }

    fn row_to_orchestration(row: sqlx::postgres::PgRow) -> Result<Orchestration, StoreError> {
        let data: serde_json::Value = row.get("data");
        decode(data)
    }
}

#[async_trait]
impl OrchestrationRepository for PostgresOrchestrationStore {
    async fn insert(&self, orchestration: &Orchestration) -> Result<(), StoreError> {
        let query = r#"
            INSERT INTO orchestrations (id, status, created_at, data)
            VALUES ($1, $2, $3, $4)
        "#;

        sqlx::query(query)
            .bind(orchestration.id.as_uuid())
            .bind(orchestration.status.as_str())
            .bind(orchestration.created_at)
            .bind(encode(orchestration)?)
            .execute(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Conflict(format!(
                        "orchestration {} already exists",
                        orchestration.id
                    ))
                } else {
                    StoreError::Database(format!("Failed to insert orchestration: {}", e))
                }
            })?;
        Ok(())
    }

    async fn update(&self, orchestration: &Orchestration) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE orchestrations SET status = $1, data = $2 WHERE id = $3")
            .bind(orchestration.status.as_str())
            .bind(encode(orchestration)?)
            .bind(orchestration.id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to update orchestration: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::OrchestrationNotFound(orchestration.id));
        }
        Ok(())
    }

    async fn get(&self, id: &OrchestrationId) -> Result<Option<Orchestration>, StoreError> {
        let row = sqlx::query("SELECT data FROM orchestrations WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to fetch orchestration: {}", e)))?;

        row.map(Self::row_to_orchestration).transpose()
    }

    async fn list(&self) -> Result<Vec<Orchestration>, StoreError> {
        let rows = sqlx::query("SELECT data FROM orchestrations ORDER BY created_at DESC")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to fetch orchestrations: {}", e)))?;

        rows.into_iter().map(Self::row_to_orchestration).collect()
    }

    async fn list_unfinished(&self) -> Result<Vec<Orchestration>, StoreError> {
        let rows = sqlx::query(
            "SELECT data FROM orchestrations WHERE status IN ('pending', 'in_progress') \
             ORDER BY created_at",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| {
            StoreError::Database(format!("Failed to fetch unfinished orchestrations: {}", e))
        })?;

        rows.into_iter().map(Self::row_to_orchestration).collect()
    }
}
