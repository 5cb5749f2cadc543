use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use zentao_core::tool::{ToolEntity, ZentaoAccount};
use zentao_core::{Connection, ScopeConfig, ZentaoProject};

use crate::store::{DomainRow, RawRecord, Store, StoreError, ToolRow};

/// Process-local store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    account_lookups: AtomicUsize,
    unavailable: AtomicBool,
}

#[derive(Debug, Default)]
struct Inner {
    connections: BTreeMap<u64, Connection>,
    scope_configs: BTreeMap<u64, ScopeConfig>,
    projects: BTreeMap<(u64, i64), ZentaoProject>,
    raw: HashMap<String, Vec<RawRecord>>,
    tool: HashMap<String, BTreeMap<(u64, String), ToolRow>>,
    domain: HashMap<String, BTreeMap<String, DomainRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of [`Store::find_account`] calls served so far.
    pub fn account_lookups(&self) -> usize {
        self.account_lookups.load(Ordering::SeqCst)
    }

    /// Makes every later call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_connection(&self, id: u64) -> Result<Option<Connection>, StoreError> {
        self.check()?;
        Ok(self.inner.lock().await.connections.get(&id).cloned())
    }

    async fn save_connection(&self, connection: &Connection) -> Result<(), StoreError> {
        self.check()?;
        self.inner
            .lock()
            .await
            .connections
            .insert(connection.id, connection.clone());
        Ok(())
    }

    async fn find_scope_config(&self, id: u64) -> Result<Option<ScopeConfig>, StoreError> {
        self.check()?;
        Ok(self.inner.lock().await.scope_configs.get(&id).cloned())
    }

    async fn save_scope_config(&self, config: &ScopeConfig) -> Result<(), StoreError> {
        self.check()?;
        self.inner
            .lock()
            .await
            .scope_configs
            .insert(config.id, config.clone());
        Ok(())
    }

    async fn find_project(
        &self,
        connection_id: u64,
        project_id: i64,
    ) -> Result<Option<ZentaoProject>, StoreError> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .await
            .projects
            .get(&(connection_id, project_id))
            .cloned())
    }

    async fn save_project(&self, project: &ZentaoProject) -> Result<(), StoreError> {
        self.check()?;
        self.inner
            .lock()
            .await
            .projects
            .insert((project.connection_id, project.id), project.clone());
        Ok(())
    }

    async fn clear_raw(&self, table: &str, params: &str) -> Result<u64, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let Some(rows) = inner.raw.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|row| row.params != params);
        Ok((before - rows.len()) as u64)
    }

    async fn insert_raw(&self, table: &str, records: &[RawRecord]) -> Result<(), StoreError> {
        self.check()?;
        self.inner
            .lock()
            .await
            .raw
            .entry(table.to_string())
            .or_default()
            .extend_from_slice(records);
        Ok(())
    }

    async fn load_raw(&self, table: &str, params: &str) -> Result<Vec<RawRecord>, StoreError> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .await
            .raw
            .get(table)
            .map(|rows| rows.iter().filter(|row| row.params == params).cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_tool_rows(&self, table: &str, rows: &[ToolRow]) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let stored = inner.tool.entry(table.to_string()).or_default();
        for row in rows {
            stored.insert((row.connection_id, row.record_key.clone()), row.clone());
        }
        Ok(())
    }

    async fn load_tool_rows(
        &self,
        table: &str,
        connection_id: u64,
        scope_id: Option<i64>,
    ) -> Result<Vec<ToolRow>, StoreError> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .await
            .tool
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|row| row.connection_id == connection_id)
                    .filter(|row| scope_id.map_or(true, |scope| row.scope_id == scope))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count_tool_rows(&self, table: &str, connection_id: u64) -> Result<usize, StoreError> {
        Ok(self.load_tool_rows(table, connection_id, None).await?.len())
    }

    async fn find_account(
        &self,
        connection_id: u64,
        account: &str,
    ) -> Result<Option<ZentaoAccount>, StoreError> {
        self.account_lookups.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let inner = self.inner.lock().await;
        let Some(rows) = inner.tool.get(ZentaoAccount::TABLE) else {
            return Ok(None);
        };
        rows.values()
            .filter(|row| row.connection_id == connection_id)
            .find(|row| row.data.get("account").and_then(|v| v.as_str()) == Some(account))
            .map(|row| serde_json::from_value(row.data.clone()))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn upsert_domain_rows(&self, table: &str, rows: &[DomainRow]) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let stored = inner.domain.entry(table.to_string()).or_default();
        for row in rows {
            stored.insert(row.id.clone(), row.clone());
        }
        Ok(())
    }

    async fn load_domain_rows(
        &self,
        table: &str,
        id_prefix: &str,
    ) -> Result<Vec<DomainRow>, StoreError> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .await
            .domain
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|row| row.id.starts_with(id_prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count_domain_rows(&self, table: &str) -> Result<usize, StoreError> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .await
            .domain
            .get(table)
            .map(BTreeMap::len)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{load_tool, raw_params, upsert_tool};
    use chrono::Utc;
    use serde_json::json;

    fn raw(params: &str, id: i64) -> RawRecord {
        RawRecord {
            params: params.to_string(),
            data: json!({"id": id}),
            input: None,
            url: "http://zentao.local/api.php/v1/users".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn clear_raw_only_touches_matching_params() {
        let store = MemoryStore::new();
        let a = raw_params(1, Some(1));
        let b = raw_params(1, Some(2));
        store
            .insert_raw("_raw_zentao_tasks", &[raw(&a, 1), raw(&a, 2), raw(&b, 3)])
            .await
            .unwrap();

        assert_eq!(store.clear_raw("_raw_zentao_tasks", &a).await.unwrap(), 2);
        assert!(store.load_raw("_raw_zentao_tasks", &a).await.unwrap().is_empty());
        assert_eq!(store.load_raw("_raw_zentao_tasks", &b).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tool_upserts_replace_by_key_and_count_account_lookups() {
        let store = MemoryStore::new();
        let mut account = ZentaoAccount {
            connection_id: 1,
            id: 5,
            account: "dev1".into(),
            realname: "Dev One".into(),
            ..Default::default()
        };
        upsert_tool(&store, 1, 0, &[account.clone()]).await.unwrap();
        account.realname = "Developer One".into();
        upsert_tool(&store, 1, 0, &[account.clone()]).await.unwrap();

        let stored: Vec<ZentaoAccount> = load_tool(&store, 1, None).await.unwrap();
        assert_eq!(stored, vec![account.clone()]);

        assert_eq!(store.find_account(1, "dev1").await.unwrap(), Some(account));
        assert_eq!(store.find_account(2, "dev1").await.unwrap(), None);
        assert_eq!(store.account_lookups(), 2);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.find_connection(1).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
