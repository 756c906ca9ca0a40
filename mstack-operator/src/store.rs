use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::debug;
use uuid::Uuid;

use mstack_tasks::{ClientError, ManagedResource, ResourceClient, ResourceKey};

/// SQLite-backed resource store.
///
/// One row per resource key. A write that changes the stored object bumps
/// `generation`; the object is ready once `observed_generation` catches up.
/// With auto-ready every write is observed immediately, otherwise an external
/// agent reports progress through [`mark_observed`](Self::mark_observed).
pub struct SqliteClient {
    pool: SqlitePool,
    auto_ready: bool,
}

/// Stored resource with its bookkeeping columns.
#[derive(Debug, Clone)]
pub struct ResourceEntry {
    pub uid: String,
    pub resource: ManagedResource,
    pub generation: i64,
    pub observed_generation: i64,
    pub created_at: String,
    pub updated_at: String,
}

fn storage_error(e: sqlx::Error) -> ClientError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            ClientError::Unavailable(e.to_string())
        }
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            ClientError::Conflict(db.to_string())
        }
        e => ClientError::Internal(e.to_string()),
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, ClientError> {
    serde_json::to_string(value).map_err(|e| ClientError::Invalid(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, ClientError> {
    serde_json::from_str(raw).map_err(|e| ClientError::Internal(format!("corrupt row: {}", e)))
}

/// Namespace column value; cluster-scoped objects use the empty string.
fn namespace_column(key: &ResourceKey) -> &str {
    key.namespace.as_deref().unwrap_or("")
}

/// Serialized (labels, depends_on, body) of a resource.
fn columns(resource: &ManagedResource) -> Result<(String, String, String), ClientError> {
    Ok((
        encode(&resource.labels)?,
        encode(&resource.depends_on)?,
        encode(&resource.body)?,
    ))
}

impl SqliteClient {
    pub async fn new(state_dir: &str, auto_ready: bool) -> Result<Self> {
        let db_path = format!("{}/resources.db", state_dir);
        let db_url = format!("sqlite:{}?mode=rwc", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool, auto_ready };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resources (
                kind TEXT NOT NULL,
                namespace TEXT NOT NULL DEFAULT '',
                name TEXT NOT NULL,
                uid TEXT NOT NULL UNIQUE,
                labels TEXT NOT NULL,
                depends_on TEXT NOT NULL,
                body TEXT NOT NULL,
                generation INTEGER NOT NULL DEFAULT 1,
                observed_generation INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (kind, namespace, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_entry(key: &ResourceKey, r: &SqliteRow) -> Result<ResourceEntry, ClientError> {
        let resource = ManagedResource {
            key: key.clone(),
            labels: decode(r.get::<&str, _>("labels"))?,
            depends_on: decode(r.get::<&str, _>("depends_on"))?,
            body: decode(r.get::<&str, _>("body"))?,
        };
        Ok(ResourceEntry {
            uid: r.get("uid"),
            resource,
            generation: r.get("generation"),
            observed_generation: r.get("observed_generation"),
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
        })
    }

    pub async fn entry(&self, key: &ResourceKey) -> Result<Option<ResourceEntry>, ClientError> {
        let row = sqlx::query(
            r#"
            SELECT uid, labels, depends_on, body, generation, observed_generation, created_at, updated_at
            FROM resources WHERE kind = ? AND namespace = ? AND name = ?
            "#,
        )
        .bind(key.kind.as_str())
        .bind(namespace_column(key))
        .bind(&key.name)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        row.map(|r| Self::row_to_entry(key, &r)).transpose()
    }

    /// Keys of every stored resource.
    pub async fn list_keys(&self) -> Result<Vec<ResourceKey>, ClientError> {
        let rows = sqlx::query("SELECT kind, namespace, name FROM resources ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

        rows.into_iter()
            .map(|r| -> Result<ResourceKey, ClientError> {
                let kind = r
                    .get::<&str, _>("kind")
                    .parse()
                    .map_err(ClientError::Internal)?;
                let namespace: String = r.get("namespace");
                let namespace = (!namespace.is_empty()).then_some(namespace.as_str());
                Ok(ResourceKey::new(kind, namespace, r.get::<String, _>("name")))
            })
            .collect()
    }

    /// Record that the platform has converged the current generation.
    ///
    /// Returns `false` if the resource does not exist.
    pub async fn mark_observed(&self, key: &ResourceKey) -> Result<bool, ClientError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE resources SET observed_generation = generation, updated_at = ?
            WHERE kind = ? AND namespace = ? AND name = ?
            "#,
        )
        .bind(&now)
        .bind(key.kind.as_str())
        .bind(namespace_column(key))
        .bind(&key.name)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(result.rows_affected() > 0)
    }

    fn initial_observed(&self) -> i64 {
        if self.auto_ready { 1 } else { 0 }
    }
}

#[async_trait]
impl ResourceClient for SqliteClient {
    async fn create_if_absent(&self, resource: &ManagedResource) -> Result<bool, ClientError> {
        let (labels, depends_on, body) = columns(resource)?;
        let now = Utc::now().to_rfc3339();
        let key = &resource.key;

        let result = sqlx::query(
            r#"
            INSERT INTO resources (kind, namespace, name, uid, labels, depends_on, body, generation, observed_generation, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?)
            ON CONFLICT (kind, namespace, name) DO NOTHING
            "#,
        )
        .bind(key.kind.as_str())
        .bind(namespace_column(key))
        .bind(&key.name)
        .bind(Uuid::new_v4().to_string())
        .bind(&labels)
        .bind(&depends_on)
        .bind(&body)
        .bind(self.initial_observed())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        let created = result.rows_affected() > 0;
        if created {
            debug!(resource = %key, "Stored new resource");
        }
        Ok(created)
    }

    async fn create_or_update(&self, resource: &ManagedResource) -> Result<(), ClientError> {
        let (labels, depends_on, body) = columns(resource)?;
        let now = Utc::now().to_rfc3339();
        let key = &resource.key;

        // Unchanged writes leave the row, and its generation, alone.
        let result = sqlx::query(
            r#"
            INSERT INTO resources (kind, namespace, name, uid, labels, depends_on, body, generation, observed_generation, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?)
            ON CONFLICT (kind, namespace, name) DO UPDATE SET
                labels = excluded.labels,
                depends_on = excluded.depends_on,
                body = excluded.body,
                generation = generation + 1,
                observed_generation = CASE WHEN ? THEN generation + 1 ELSE observed_generation END,
                updated_at = excluded.updated_at
            WHERE labels != excluded.labels
                OR depends_on != excluded.depends_on
                OR body != excluded.body
            "#,
        )
        .bind(key.kind.as_str())
        .bind(namespace_column(key))
        .bind(&key.name)
        .bind(Uuid::new_v4().to_string())
        .bind(&labels)
        .bind(&depends_on)
        .bind(&body)
        .bind(self.initial_observed())
        .bind(&now)
        .bind(&now)
        .bind(self.auto_ready)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() > 0 {
            debug!(resource = %key, "Stored resource");
        }
        Ok(())
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), ClientError> {
        let result = sqlx::query("DELETE FROM resources WHERE kind = ? AND namespace = ? AND name = ?")
            .bind(key.kind.as_str())
            .bind(namespace_column(key))
            .bind(&key.name)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

        if result.rows_affected() > 0 {
            debug!(resource = %key, "Deleted resource");
        }
        Ok(())
    }

    async fn is_ready(&self, key: &ResourceKey) -> Result<bool, ClientError> {
        let row = sqlx::query(
            r#"
            SELECT generation, observed_generation FROM resources
            WHERE kind = ? AND namespace = ? AND name = ?
            "#,
        )
        .bind(key.kind.as_str())
        .bind(namespace_column(key))
        .bind(&key.name)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(row.is_some_and(|r| {
            !key.kind.has_readiness()
                || r.get::<i64, _>("observed_generation") >= r.get::<i64, _>("generation")
        }))
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<ManagedResource>, ClientError> {
        Ok(self.entry(key).await?.map(|e| e.resource))
    }
}
