use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{CorrelationId, RepositoryError, Result, SagaRecord, Version, store::SagaRepository};

const NATURAL_KEY_CONSTRAINT: &str = "unique_saga_natural_key";
const PRIMARY_KEY_CONSTRAINT: &str = "saga_instances_pkey";

/// PostgreSQL-backed saga repository.
///
/// Concurrency is optimistic: every update and delete is conditioned on the
/// `version` column, so two processes dispatching to the same instance
/// cannot both win.
#[derive(Clone)]
pub struct PostgresSagaRepository {
    pool: PgPool,
}

impl PostgresSagaRepository {
    /// Creates a new PostgreSQL saga repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_record(row: PgRow) -> Result<SagaRecord> {
        Ok(SagaRecord {
            saga_type: row.try_get("saga_type")?,
            correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            unique_key: row.try_get("unique_key")?,
            state: row.try_get("state")?,
            version: Version::new(row.try_get("version")?),
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn current_version(
        &self,
        saga_type: &str,
        correlation_id: CorrelationId,
    ) -> Result<Option<Version>> {
        let version: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM saga_instances WHERE saga_type = $1 AND correlation_id = $2",
        )
        .bind(saga_type)
        .bind(correlation_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        Ok(version.map(Version::new))
    }
}

#[async_trait]
impl SagaRepository for PostgresSagaRepository {
    #[tracing::instrument(skip(self))]
    async fn load(
        &self,
        saga_type: &str,
        correlation_id: CorrelationId,
    ) -> Result<Option<SagaRecord>> {
        let row = sqlx::query(
            r#"
            SELECT saga_type, correlation_id, unique_key, state, version, payload, created_at, updated_at
            FROM saga_instances
            WHERE saga_type = $1 AND correlation_id = $2
            "#,
        )
        .bind(saga_type)
        .bind(correlation_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }

    #[tracing::instrument(skip(self, record), fields(saga_type = %record.saga_type, correlation_id = %record.correlation_id))]
    async fn insert(&self, record: SagaRecord) -> Result<Version> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO saga_instances (saga_type, correlation_id, unique_key, state, version, payload, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&record.saga_type)
        .bind(record.correlation_id.as_uuid())
        .bind(&record.unique_key)
        .bind(&record.state)
        .bind(Version::first().as_i64())
        .bind(&record.payload)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                match db_err.constraint() {
                    Some(PRIMARY_KEY_CONSTRAINT) => {
                        return RepositoryError::DuplicateKey {
                            correlation_id: record.correlation_id,
                            key: record.correlation_id.to_string(),
                        };
                    }
                    Some(NATURAL_KEY_CONSTRAINT) => {
                        return RepositoryError::DuplicateKey {
                            correlation_id: record.correlation_id,
                            key: record.unique_key.clone().unwrap_or_default(),
                        };
                    }
                    _ => {}
                }
            }
            RepositoryError::Database(e)
        })?;

        Ok(Version::first())
    }

    #[tracing::instrument(skip(self, record), fields(saga_type = %record.saga_type, correlation_id = %record.correlation_id))]
    async fn save(&self, record: SagaRecord, expected: Version) -> Result<Version> {
        let new_version = expected.next();

        let result = sqlx::query(
            r#"
            UPDATE saga_instances
            SET state = $3, unique_key = $4, version = $5, payload = $6, updated_at = $7
            WHERE saga_type = $1 AND correlation_id = $2 AND version = $8
            "#,
        )
        .bind(&record.saga_type)
        .bind(record.correlation_id.as_uuid())
        .bind(&record.state)
        .bind(&record.unique_key)
        .bind(new_version.as_i64())
        .bind(&record.payload)
        .bind(Utc::now())
        .bind(expected.as_i64())
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err)
                if db_err.constraint() == Some(NATURAL_KEY_CONSTRAINT) =>
            {
                RepositoryError::DuplicateKey {
                    correlation_id: record.correlation_id,
                    key: record.unique_key.clone().unwrap_or_default(),
                }
            }
            e => RepositoryError::Database(e),
        })?;

        if result.rows_affected() == 1 {
            return Ok(new_version);
        }

        match self
            .current_version(&record.saga_type, record.correlation_id)
            .await?
        {
            Some(actual) => Err(RepositoryError::ConcurrencyConflict {
                correlation_id: record.correlation_id,
                expected,
                actual,
            }),
            None => Err(RepositoryError::NotFound(record.correlation_id)),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn delete(
        &self,
        saga_type: &str,
        correlation_id: CorrelationId,
        expected: Version,
    ) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM saga_instances WHERE saga_type = $1 AND correlation_id = $2 AND version = $3",
        )
        .bind(saga_type)
        .bind(correlation_id.as_uuid())
        .bind(expected.as_i64())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.current_version(saga_type, correlation_id).await? {
            Some(actual) => Err(RepositoryError::ConcurrencyConflict {
                correlation_id,
                expected,
                actual,
            }),
            None => Ok(()),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn list(&self, saga_type: &str) -> Result<Vec<SagaRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT saga_type, correlation_id, unique_key, state, version, payload, created_at, updated_at
            FROM saga_instances
            WHERE saga_type = $1
            ORDER BY created_at ASC, correlation_id ASC
            "#,
        )
        .bind(saga_type)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }
}
