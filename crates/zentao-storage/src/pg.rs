use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::debug;
use zentao_core::tool::{ToolEntity, ZentaoAccount};
use zentao_core::{Connection, ScopeConfig, ZentaoProject};

use crate::store::{DomainRow, RawRecord, Store, StoreError, ToolRow};

/// Postgres-backed store; every entity is a JSONB document under a composite key.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn pg_id(id: u64) -> i64 {
    id as i64
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn load_document<T: serde::de::DeserializeOwned>(
        &self,
        sql: &str,
        keys: (i64, Option<i64>),
    ) -> Result<Option<T>, StoreError> {
        let mut query = sqlx::query(sql).bind(keys.0);
        if let Some(second) = keys.1 {
            query = query.bind(second);
        }
        let Some(row) = query.fetch_optional(&self.pool).await? else {
            return Ok(None);
        };
        let data: Value = row.try_get("data")?;
        Ok(Some(serde_json::from_value(data)?))
    }
}

#[async_trait]
impl Store for PgStore {
    async fn find_connection(&self, id: u64) -> Result<Option<Connection>, StoreError> {
        self.load_document("SELECT data FROM connections WHERE id = $1", (pg_id(id), None))
            .await
    }

    async fn save_connection(&self, connection: &Connection) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO connections (id, data, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data, updated_at = NOW()
            "#,
        )
        .bind(pg_id(connection.id))
        .bind(serde_json::to_value(connection)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_scope_config(&self, id: u64) -> Result<Option<ScopeConfig>, StoreError> {
        self.load_document("SELECT data FROM scope_configs WHERE id = $1", (pg_id(id), None))
            .await
    }

    async fn save_scope_config(&self, config: &ScopeConfig) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO scope_configs (id, connection_id, data, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (id) DO UPDATE
               SET connection_id = EXCLUDED.connection_id,
                   data = EXCLUDED.data,
                   updated_at = NOW()
            "#,
        )
        .bind(pg_id(config.id))
        .bind(pg_id(config.connection_id))
        .bind(serde_json::to_value(config)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_project(
        &self,
        connection_id: u64,
        project_id: i64,
    ) -> Result<Option<ZentaoProject>, StoreError> {
        self.load_document(
            "SELECT data FROM projects WHERE connection_id = $1 AND id = $2",
            (pg_id(connection_id), Some(project_id)),
        )
        .await
    }

    async fn save_project(&self, project: &ZentaoProject) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO projects (connection_id, id, data, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (connection_id, id) DO UPDATE SET data = EXCLUDED.data, updated_at = NOW()
            "#,
        )
        .bind(pg_id(project.connection_id))
        .bind(project.id)
        .bind(serde_json::to_value(project)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_raw(&self, table: &str, params: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM raw_records WHERE raw_table = $1 AND params = $2")
            .bind(table)
            .bind(params)
            .execute(&self.pool)
            .await?;
        debug!(table, params, removed = result.rows_affected(), "cleared raw rows");
        Ok(result.rows_affected())
    }

    async fn insert_raw(&self, table: &str, records: &[RawRecord]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO raw_records (raw_table, params, data, input, url, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(table)
            .bind(&record.params)
            .bind(&record.data)
            .bind(&record.input)
            .bind(&record.url)
            .bind(record.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_raw(&self, table: &str, params: &str) -> Result<Vec<RawRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT params, data, input, url, created_at
              FROM raw_records
             WHERE raw_table = $1 AND params = $2
             ORDER BY id
            "#,
        )
        .bind(table)
        .bind(params)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let created_at: DateTime<Utc> = row.try_get("created_at")?;
            out.push(RawRecord {
                params: row.try_get("params")?,
                data: row.try_get("data")?,
                input: row.try_get("input")?,
                url: row.try_get("url")?,
                created_at,
            });
        }
        Ok(out)
    }

    async fn upsert_tool_rows(&self, table: &str, rows: &[ToolRow]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO tool_records (tool_table, connection_id, record_key, scope_id, data, updated_at)
                VALUES ($1, $2, $3, $4, $5, NOW())
                ON CONFLICT (tool_table, connection_id, record_key) DO UPDATE
                   SET scope_id = EXCLUDED.scope_id,
                       data = EXCLUDED.data,
                       updated_at = NOW()
                "#,
            )
            .bind(table)
            .bind(pg_id(row.connection_id))
            .bind(&row.record_key)
            .bind(row.scope_id)
            .bind(&row.data)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_tool_rows(
        &self,
        table: &str,
        connection_id: u64,
        scope_id: Option<i64>,
    ) -> Result<Vec<ToolRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT connection_id, scope_id, record_key, data
              FROM tool_records
             WHERE tool_table = $1
               AND connection_id = $2
               AND ($3::BIGINT IS NULL OR scope_id = $3)
             ORDER BY record_key
            "#,
        )
        .bind(table)
        .bind(pg_id(connection_id))
        .bind(scope_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let connection_id: i64 = row.try_get("connection_id")?;
            out.push(ToolRow {
                connection_id: connection_id as u64,
                scope_id: row.try_get("scope_id")?,
                record_key: row.try_get("record_key")?,
                data: row.try_get("data")?,
            });
        }
        Ok(out)
    }

    async fn count_tool_rows(&self, table: &str, connection_id: u64) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tool_records WHERE tool_table = $1 AND connection_id = $2",
        )
        .bind(table)
        .bind(pg_id(connection_id))
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn find_account(
        &self,
        connection_id: u64,
        account: &str,
    ) -> Result<Option<ZentaoAccount>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT data
              FROM tool_records
             WHERE tool_table = $1
               AND connection_id = $2
               AND data->>'account' = $3
             LIMIT 1
            "#,
        )
        .bind(ZentaoAccount::TABLE)
        .bind(pg_id(connection_id))
        .bind(account)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let data: Value = row.try_get("data")?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    async fn upsert_domain_rows(&self, table: &str, rows: &[DomainRow]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO domain_records (domain_table, id, data, updated_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (domain_table, id) DO UPDATE SET data = EXCLUDED.data, updated_at = NOW()
                "#,
            )
            .bind(table)
            .bind(&row.id)
            .bind(&row.data)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_domain_rows(
        &self,
        table: &str,
        id_prefix: &str,
    ) -> Result<Vec<DomainRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, data
              FROM domain_records
             WHERE domain_table = $1 AND starts_with(id, $2)
             ORDER BY id
            "#,
        )
        .bind(table)
        .bind(id_prefix)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(DomainRow {
                id: row.try_get("id")?,
                data: row.try_get("data")?,
            });
        }
        Ok(out)
    }

    async fn count_domain_rows(&self, table: &str) -> Result<usize, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM domain_records WHERE domain_table = $1")
                .bind(table)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }
}
