use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::Row;

use super::{BackendError, ObjectBackend, PersistedRecord};

/// Backend storing records in a `conduit_objects` table.
pub struct PostgresBackend {
    name: String,
    pool: PgPool,
}

impl PostgresBackend {
    pub fn new(name: impl Into<String>, pool: PgPool) -> Self {
        Self {
            name: name.into(),
            pool,
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(name: impl Into<String>, database_url: &str) -> anyhow::Result<Self> {
        let name = name.into();
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .with_context(|| format!("Failed to connect to {} database", name))?;
        Ok(Self::new(name, pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the objects table if it does not exist.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conduit_objects (
                key TEXT PRIMARY KEY,
                encoded_strands BYTEA NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                context JSONB NOT NULL DEFAULT '{}'::jsonb,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create conduit_objects table")?;
        Ok(())
    }
}

#[async_trait]
impl ObjectBackend for PostgresBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, record: &PersistedRecord) -> Result<(), BackendError> {
        sqlx::query(
            r#"
            INSERT INTO conduit_objects (key, encoded_strands, metadata, context, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (key) DO UPDATE SET
                encoded_strands = EXCLUDED.encoded_strands,
                metadata = EXCLUDED.metadata,
                context = EXCLUDED.context,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.key)
        .bind(record.encoded_strands.as_ref())
        .bind(&record.metadata)
        .bind(&record.context)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to upsert object")
        .map_err(BackendError::Unavailable)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<PersistedRecord, BackendError> {
        let row = sqlx::query(
            r#"
            SELECT key, encoded_strands, metadata, context, updated_at
            FROM conduit_objects
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get object")
        .map_err(BackendError::Unavailable)?
        .ok_or(BackendError::NotFound)?;

        Ok(PersistedRecord {
            key: decode_column(&row, "key")?,
            encoded_strands: Bytes::from(decode_column::<Vec<u8>>(&row, "encoded_strands")?),
            metadata: decode_column(&row, "metadata")?,
            context: decode_column(&row, "context")?,
            updated_at: decode_column(&row, "updated_at")?,
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let result = sqlx::query("DELETE FROM conduit_objects WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .context("Failed to delete object")
            .map_err(BackendError::Unavailable)?;
        Ok(result.rows_affected() > 0)
    }
}

fn decode_column<'r, T>(row: &'r PgRow, column: &'static str) -> Result<T, BackendError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .with_context(|| format!("Failed to decode column {}", column))
        .map_err(BackendError::Unavailable)
}

impl std::fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
