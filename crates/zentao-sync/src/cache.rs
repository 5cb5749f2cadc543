//! Run-scoped caches shared by every unit of one task.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;
use zentao_core::tool::ZentaoAccount;
use zentao_core::IssueKind;
use zentao_storage::{Store, StoreError};

/// Ids of one entity class already extracted in this run.
#[derive(Debug, Default)]
pub struct EntityCache {
    ids: Mutex<BTreeSet<i64>>,
}

impl EntityCache {
    /// Returns `true` if the id was not seen before.
    pub fn insert(&self, id: i64) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted copy of the ids seen so far.
    pub fn snapshot(&self) -> Vec<i64> {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct EntityCaches {
    pub stories: EntityCache,
    pub tasks: EntityCache,
    pub bugs: EntityCache,
}

impl EntityCaches {
    pub fn for_kind(&self, kind: IssueKind) -> &EntityCache {
        match kind {
            IssueKind::Task => &self.tasks,
            IssueKind::Story => &self.stories,
            IssueKind::Bug => &self.bugs,
        }
    }
}

type AccountSlot = Arc<OnceCell<Option<ZentaoAccount>>>;

/// Memoizes remote account name -> extracted account for one connection.
///
/// Misses are cached too. Concurrent first lookups of one name share a single store read.
pub struct AccountCache {
    connection_id: u64,
    store: Arc<dyn Store>,
    slots: Mutex<HashMap<String, AccountSlot>>,
    placeholders: Mutex<BTreeSet<String>>,
}

impl AccountCache {
    pub fn new(connection_id: u64, store: Arc<dyn Store>) -> Self {
        Self {
            connection_id,
            store,
            slots: Mutex::new(HashMap::new()),
            placeholders: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub async fn resolve(&self, account: &str) -> Result<Option<ZentaoAccount>, StoreError> {
        let key = account.trim();
        if key.is_empty() {
            return Ok(None);
        }

        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone();

        let resolved = slot
            .get_or_try_init(|| self.store.find_account(self.connection_id, key))
            .await?;
        Ok(resolved.clone())
    }

    /// Whether a placeholder row for `account` has already been written.
    pub fn has_placeholder(&self, account: &str) -> bool {
        self.placeholders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(account.trim())
    }

    /// Records that a placeholder was written for `account`; `true` the first time only.
    pub fn mark_placeholder(&self, account: &str) -> bool {
        self.placeholders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account.trim().to_string())
    }

    pub fn placeholders(&self) -> Vec<String> {
        self.placeholders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for AccountCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cached = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("AccountCache")
            .field("connection_id", &self.connection_id)
            .field("cached", &cached)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zentao_storage::{upsert_tool, MemoryStore};

    async fn store_with_account() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let account = ZentaoAccount {
            connection_id: 1,
            id: 11,
            account: "dev1".into(),
            realname: "Dev One".into(),
            ..Default::default()
        };
        upsert_tool(&*store, 1, 0, &[account]).await.unwrap();
        store
    }

    #[test]
    fn entity_cache_deduplicates() {
        let cache = EntityCache::default();
        assert!(cache.insert(3));
        assert!(cache.insert(1));
        assert!(!cache.insert(3));
        assert!(cache.contains(1));
        assert_eq!(cache.snapshot(), vec![1, 3]);
    }

    #[tokio::test]
    async fn second_lookup_is_served_from_memory() {
        let store = store_with_account().await;
        let cache = AccountCache::new(1, store.clone());

        let first = cache.resolve("dev1").await.unwrap();
        let second = cache.resolve("dev1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.map(|a| a.id), Some(11));
        assert_eq!(store.account_lookups(), 1);

        assert_eq!(cache.resolve("ghost").await.unwrap(), None);
        assert_eq!(cache.resolve("ghost").await.unwrap(), None);
        assert_eq!(store.account_lookups(), 2);
    }

    #[tokio::test]
    async fn blank_names_never_reach_the_store() {
        let store = store_with_account().await;
        let cache = AccountCache::new(1, store.clone());
        assert_eq!(cache.resolve("  ").await.unwrap(), None);
        assert_eq!(store.account_lookups(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_lookups_share_one_read() {
        let store = store_with_account().await;
        let cache = Arc::new(AccountCache::new(1, store.clone()));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.resolve("dev1").await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().is_some());
        }
        assert_eq!(store.account_lookups(), 1);
    }

    #[tokio::test]
    async fn store_failures_are_not_cached() {
        let store = store_with_account().await;
        let cache = AccountCache::new(1, store.clone());

        store.set_unavailable(true);
        assert!(cache.resolve("dev1").await.is_err());
        store.set_unavailable(false);
        assert!(cache.resolve("dev1").await.unwrap().is_some());
    }

    #[test]
    fn placeholders_are_marked_once() {
        let cache = AccountCache::new(1, Arc::new(MemoryStore::new()));
        assert!(!cache.has_placeholder("ghost"));
        assert!(cache.mark_placeholder("ghost"));
        assert!(!cache.mark_placeholder("ghost "));
        assert!(cache.has_placeholder(" ghost"));
        assert_eq!(cache.placeholders(), vec!["ghost".to_string()]);
    }
}
