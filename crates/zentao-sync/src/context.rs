use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;
use zentao_core::domain::domain_id;
use zentao_core::{
    Connection, EntityFamily, IssueKind, ScopeConfig, SyncPolicy, TaskOptions, ZentaoProject,
    API_PATH_SUFFIX,
};
use zentao_sources::{
    open_collection, AcquirerFactory, Collection, RemoteDbDefaults, ScopeParams,
};
use zentao_storage::{raw_params, HttpClientConfig, Store};

use crate::cache::{AccountCache, EntityCaches};
use crate::error::TaskError;

/// Process-level knobs a context is built with.
#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub remote_db: RemoteDbDefaults,
    pub http: HttpClientConfig,
    pub page_size: u32,
    pub max_pages: u32,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            remote_db: RemoteDbDefaults::default(),
            http: HttpClientConfig::default(),
            page_size: 100,
            max_pages: 1_000,
        }
    }
}

/// Web UI root derived from the API endpoint: `/api.php/v1` is cut from the path and a trailing
/// `/` kept, e.g. `http://10.0.0.1:30001/api.php/v1/` -> `http://10.0.0.1:30001/`.
pub fn home_page(endpoint: &str) -> Result<String, TaskError> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(TaskError::Configuration(
            "connection endpoint is empty".to_string(),
        ));
    }
    let mut url = Url::parse(endpoint).map_err(|err| {
        TaskError::Configuration(format!("connection endpoint {endpoint:?} is invalid: {err}"))
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(TaskError::Configuration(format!(
            "connection endpoint {endpoint:?} is not an http(s) url"
        )));
    }

    let path = url.path().to_string();
    let mut root = match path.find(API_PATH_SUFFIX) {
        Some(index) => path[..index].to_string(),
        None => path,
    };
    if !root.ends_with('/') {
        root.push('/');
    }
    url.set_path(&root);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}

/// Everything one run shares across its units.
///
/// Built once by [`TaskContext::prepare`]; the caches grow monotonically; [`TaskContext::close`]
/// releases the acquirer.
pub struct TaskContext {
    pub run_id: Uuid,
    pub options: TaskOptions,
    pub policy: SyncPolicy,
    pub connection: Connection,
    pub project: Option<ZentaoProject>,
    pub scope_config: ScopeConfig,
    pub home_page: String,
    pub collection: Collection,
    pub store: Arc<dyn Store>,
    pub entities: EntityCaches,
    pub accounts: AccountCache,
    pub page_size: u32,
    pub max_pages: u32,
    closed: AtomicBool,
}

impl TaskContext {
    pub async fn prepare(
        options: Value,
        policy: SyncPolicy,
        store: Arc<dyn Store>,
        factory: &dyn AcquirerFactory,
        settings: &ContextSettings,
    ) -> Result<Self, TaskError> {
        let options = TaskOptions::decode(options)?;

        let connection = store
            .find_connection(options.connection_id)
            .await?
            .ok_or_else(|| TaskError::NotFound {
                entity: "connection",
                id: options.connection_id.to_string(),
            })?;

        let home_page = home_page(&connection.endpoint)?;

        let project = match options.project_id {
            Some(project_id) => Some(
                store
                    .find_project(connection.id, project_id)
                    .await?
                    .ok_or_else(|| TaskError::NotFound {
                        entity: "project",
                        id: project_id.to_string(),
                    })?,
            ),
            None => None,
        };

        let scope_config = resolve_scope_config(&options, project.as_ref(), store.as_ref()).await?;

        let collection = open_collection(
            policy,
            &connection,
            &settings.remote_db,
            &settings.http,
            factory,
        )
        .await?;

        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            connection_id = connection.id,
            project_id = ?options.project_id,
            skip_collectors = policy.skip_collectors,
            home_page = %home_page,
            "task context prepared"
        );

        let accounts = AccountCache::new(connection.id, store.clone());
        Ok(Self {
            run_id,
            options,
            policy,
            connection,
            project,
            scope_config,
            home_page,
            collection,
            store,
            entities: EntityCaches::default(),
            accounts,
            page_size: settings.page_size.max(1),
            max_pages: settings.max_pages.max(1),
            closed: AtomicBool::new(false),
        })
    }

    /// Releases the acquirer. Only the first call has an effect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match &self.collection {
            Collection::Active(acquirer) => {
                acquirer.release().await;
                info!(run_id = %self.run_id, "acquirer released");
            }
            Collection::Skipped => {}
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn connection_id(&self) -> u64 {
        self.connection.id
    }

    pub fn project_id(&self) -> Option<i64> {
        self.options.project_id
    }

    pub fn scope_params(&self) -> ScopeParams {
        ScopeParams {
            connection_id: self.connection.id,
            project_id: self.project_id(),
        }
    }

    /// Tool-row scope of a family: the project, or 0 for connection-wide families.
    pub fn scope_id(&self, family: EntityFamily) -> i64 {
        if family.is_connection_wide() {
            0
        } else {
            self.project_id().unwrap_or(0)
        }
    }

    pub fn raw_params(&self, family: EntityFamily) -> String {
        if family.is_connection_wide() {
            raw_params(self.connection.id, None)
        } else {
            raw_params(self.connection.id, self.project_id())
        }
    }

    pub fn domain_id(&self, tool_entity: &str, key: impl std::fmt::Display) -> String {
        domain_id(tool_entity, self.connection.id, key)
    }

    pub fn issue_url(&self, kind: IssueKind, id: i64) -> String {
        format!("{}{}-view-{id}.html", self.home_page, kind.as_str())
    }

    pub fn execution_url(&self, id: i64) -> String {
        format!("{}execution-task-{id}.html", self.home_page)
    }

    pub fn project_url(&self, id: i64) -> String {
        format!("{}project-index-{id}.html", self.home_page)
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("run_id", &self.run_id)
            .field("connection", &self.connection)
            .field("project_id", &self.project_id())
            .field("home_page", &self.home_page)
            .field("collection", &self.collection)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for TaskContext {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Collection::Active(acquirer) = &self.collection {
                warn!(run_id = %self.run_id, ?acquirer, "task context dropped without close");
            }
        }
    }
}

async fn resolve_scope_config(
    options: &TaskOptions,
    project: Option<&ZentaoProject>,
    store: &dyn Store,
) -> Result<ScopeConfig, TaskError> {
    if let Some(config) = &options.scope_config {
        return Ok(config.clone());
    }
    let id = options
        .scope_config_id
        .or_else(|| project.and_then(|p| p.scope_config_id).filter(|id| *id > 0));
    let Some(id) = id else {
        return Ok(ScopeConfig::default());
    };
    store
        .find_scope_config(id)
        .await?
        .ok_or_else(|| TaskError::BadInput(format!("scope config {id} not found")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use zentao_sources::{AcquireError, DataAcquirer, Page, PageRequest, PageSource, RemoteDbSettings};
    use zentao_storage::{FetchError, MemoryStore};

    struct CountingSource {
        releases: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl PageSource for CountingSource {
        async fn fetch_page(&self, _request: &PageRequest<'_>) -> Result<Page, FetchError> {
            Ok(Page {
                records: vec![],
                url: String::new(),
                more: false,
            })
        }

        async fn release(&self) {
            *self.releases.lock().unwrap() += 1;
        }

        fn describe(&self) -> String {
            "counting".into()
        }
    }

    #[derive(Default)]
    struct RecordingFactory {
        opened: Mutex<Vec<&'static str>>,
        releases: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl AcquirerFactory for RecordingFactory {
        async fn open_remote_db(
            &self,
            _settings: &RemoteDbSettings,
        ) -> Result<DataAcquirer, AcquireError> {
            self.opened.lock().unwrap().push("db");
            Ok(DataAcquirer::RemoteDb(Arc::new(CountingSource {
                releases: self.releases.clone(),
            })))
        }

        async fn open_api(
            &self,
            _connection: &Connection,
            _http: &HttpClientConfig,
        ) -> Result<DataAcquirer, AcquireError> {
            self.opened.lock().unwrap().push("api");
            Ok(DataAcquirer::Api(Arc::new(CountingSource {
                releases: self.releases.clone(),
            })))
        }
    }

    async fn seeded_store(endpoint: &str) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .save_connection(&Connection {
                id: 1,
                name: "zentao".into(),
                endpoint: endpoint.into(),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .save_project(&ZentaoProject {
                connection_id: 1,
                id: 3,
                name: "Demo".into(),
                scope_config_id: Some(7),
                ..Default::default()
            })
            .await
            .unwrap();
        store
    }

    #[test]
    fn home_page_strips_the_api_path() {
        assert_eq!(
            home_page("http://54.158.1.10:30001/api.php/v1/").unwrap(),
            "http://54.158.1.10:30001/"
        );
        assert_eq!(
            home_page("https://pm.example.com/zentao/api.php/v1").unwrap(),
            "https://pm.example.com/zentao/"
        );
        assert_eq!(
            home_page("http://pm.example.com").unwrap(),
            "http://pm.example.com/"
        );
    }

    #[test]
    fn unusable_endpoints_are_configuration_errors() {
        for endpoint in ["", "   ", "zentao", "mailto:pm@example.com"] {
            assert!(
                matches!(home_page(endpoint), Err(TaskError::Configuration(_))),
                "{endpoint:?}"
            );
        }
    }

    #[tokio::test]
    async fn empty_endpoint_fails_before_any_acquirer_opens() {
        let store = seeded_store("").await;
        let factory = RecordingFactory::default();
        let err = TaskContext::prepare(
            json!({"connectionId": 1}),
            SyncPolicy::default(),
            store,
            &factory,
            &ContextSettings::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TaskError::Configuration(_)));
        assert!(factory.opened.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_connection_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let factory = RecordingFactory::default();
        let err = TaskContext::prepare(
            json!({"connectionId": 9}),
            SyncPolicy::default(),
            store,
            &factory,
            &ContextSettings::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TaskError::NotFound { entity: "connection", .. }));
    }

    #[tokio::test]
    async fn unknown_scope_config_is_bad_input() {
        let store = seeded_store("http://zentao.local/api.php/v1/").await;
        let factory = RecordingFactory::default();
        let err = TaskContext::prepare(
            json!({"connectionId": 1, "projectId": 3}),
            SyncPolicy::default(),
            store,
            &factory,
            &ContextSettings::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TaskError::BadInput(_)));
        assert!(factory.opened.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn scope_config_store_failure_is_fatal() {
        let store = seeded_store("http://zentao.local/api.php/v1/").await;
        let factory = RecordingFactory::default();
        let options = TaskOptions::decode(json!({"connectionId": 1, "scopeConfigId": 7})).unwrap();
        store.set_unavailable(true);
        let err = resolve_scope_config(&options, None, &*store)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Store(_)));
        assert!(factory.opened.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_releases_the_acquirer_once() {
        let store = seeded_store("http://zentao.local/api.php/v1/").await;
        store
            .save_scope_config(&ScopeConfig {
                id: 7,
                connection_id: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        let factory = RecordingFactory::default();
        let ctx = TaskContext::prepare(
            json!({"connectionId": 1, "projectId": 3}),
            SyncPolicy::default(),
            store,
            &factory,
            &ContextSettings::default(),
        )
        .await
        .unwrap();

        assert_eq!(*factory.opened.lock().unwrap(), vec!["api"]);
        assert_eq!(ctx.home_page, "http://zentao.local/");
        assert_eq!(ctx.scope_config.id, 7);
        assert_eq!(
            ctx.issue_url(IssueKind::Bug, 5),
            "http://zentao.local/bug-view-5.html"
        );

        ctx.close().await;
        ctx.close().await;
        assert_eq!(*factory.releases.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn skip_collectors_builds_a_context_without_sources() {
        let store = seeded_store("http://zentao.local/api.php/v1/").await;
        let factory = RecordingFactory::default();
        let ctx = TaskContext::prepare(
            json!({"connectionId": 1, "scopeConfig": {"entities": ["TICKET"]}}),
            SyncPolicy {
                skip_collectors: true,
            },
            store,
            &factory,
            &ContextSettings::default(),
        )
        .await
        .unwrap();
        assert!(matches!(ctx.collection, Collection::Skipped));
        assert!(factory.opened.lock().unwrap().is_empty());
        assert!(ctx.scope_config.enables(zentao_core::DomainType::Ticket));
        assert!(!ctx.scope_config.enables(zentao_core::DomainType::Cross));
        ctx.close().await;
    }
}
