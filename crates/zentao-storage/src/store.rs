use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use zentao_core::domain::DomainEntity;
use zentao_core::tool::{ToolEntity, ZentaoAccount};
use zentao_core::{Connection, ScopeConfig, ZentaoProject};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored row is not valid json for its type: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One collected page entry, staged verbatim until Extract decodes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub params: String,
    pub data: Value,
    pub input: Option<Value>,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRow {
    pub connection_id: u64,
    /// Project id, or 0 for connection-wide rows.
    pub scope_id: i64,
    pub record_key: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRow {
    pub id: String,
    pub data: Value,
}

/// Params string identifying the raw rows of one collection scope.
pub fn raw_params(connection_id: u64, project_id: Option<i64>) -> String {
    let value = match project_id {
        Some(project_id) => serde_json::json!({"ConnectionId": connection_id, "ProjectId": project_id}),
        None => serde_json::json!({"ConnectionId": connection_id}),
    };
    value.to_string()
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn find_connection(&self, id: u64) -> Result<Option<Connection>, StoreError>;
    async fn save_connection(&self, connection: &Connection) -> Result<(), StoreError>;

    async fn find_scope_config(&self, id: u64) -> Result<Option<ScopeConfig>, StoreError>;
    async fn save_scope_config(&self, config: &ScopeConfig) -> Result<(), StoreError>;

    async fn find_project(
        &self,
        connection_id: u64,
        project_id: i64,
    ) -> Result<Option<ZentaoProject>, StoreError>;
    async fn save_project(&self, project: &ZentaoProject) -> Result<(), StoreError>;

    /// Deletes the raw rows of `table` collected under `params`; returns how many were removed.
    async fn clear_raw(&self, table: &str, params: &str) -> Result<u64, StoreError>;
    async fn insert_raw(&self, table: &str, records: &[RawRecord]) -> Result<(), StoreError>;
    async fn load_raw(&self, table: &str, params: &str) -> Result<Vec<RawRecord>, StoreError>;

    async fn upsert_tool_rows(&self, table: &str, rows: &[ToolRow]) -> Result<(), StoreError>;
    /// Rows of one connection; `scope_id` narrows to one project when given.
    async fn load_tool_rows(
        &self,
        table: &str,
        connection_id: u64,
        scope_id: Option<i64>,
    ) -> Result<Vec<ToolRow>, StoreError>;
    async fn count_tool_rows(&self, table: &str, connection_id: u64) -> Result<usize, StoreError>;

    /// Looks an extracted account up by its login name.
    async fn find_account(
        &self,
        connection_id: u64,
        account: &str,
    ) -> Result<Option<ZentaoAccount>, StoreError>;

    async fn upsert_domain_rows(&self, table: &str, rows: &[DomainRow]) -> Result<(), StoreError>;
    async fn load_domain_rows(&self, table: &str, id_prefix: &str)
        -> Result<Vec<DomainRow>, StoreError>;
    async fn count_domain_rows(&self, table: &str) -> Result<usize, StoreError>;
}

pub async fn upsert_tool<T: ToolEntity>(
    store: &dyn Store,
    connection_id: u64,
    scope_id: i64,
    items: &[T],
) -> Result<usize, StoreError> {
    let rows = items
        .iter()
        .map(|item| {
            Ok(ToolRow {
                connection_id,
                scope_id,
                record_key: item.record_key(),
                data: serde_json::to_value(item)?,
            })
        })
        .collect::<Result<Vec<_>, StoreError>>()?;
    store.upsert_tool_rows(T::TABLE, &rows).await?;
    Ok(rows.len())
}

pub async fn load_tool<T: ToolEntity>(
    store: &dyn Store,
    connection_id: u64,
    scope_id: Option<i64>,
) -> Result<Vec<T>, StoreError> {
    store
        .load_tool_rows(T::TABLE, connection_id, scope_id)
        .await?
        .into_iter()
        .map(|row| serde_json::from_value(row.data).map_err(StoreError::from))
        .collect()
}

pub async fn upsert_domain<T: DomainEntity>(
    store: &dyn Store,
    items: &[T],
) -> Result<usize, StoreError> {
    let rows = items
        .iter()
        .map(|item| {
            Ok(DomainRow {
                id: item.domain_key(),
                data: serde_json::to_value(item)?,
            })
        })
        .collect::<Result<Vec<_>, StoreError>>()?;
    store.upsert_domain_rows(T::TABLE, &rows).await?;
    Ok(rows.len())
}

pub async fn load_domain<T: DomainEntity>(
    store: &dyn Store,
    id_prefix: &str,
) -> Result<Vec<T>, StoreError> {
    store
        .load_domain_rows(T::TABLE, id_prefix)
        .await?
        .into_iter()
        .map(|row| serde_json::from_value(row.data).map_err(StoreError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_params_are_stable_json() {
        assert_eq!(
            raw_params(3, Some(7)),
            r#"{"ConnectionId":3,"ProjectId":7}"#
        );
        assert_eq!(raw_params(3, None), r#"{"ConnectionId":3}"#);
    }
}
