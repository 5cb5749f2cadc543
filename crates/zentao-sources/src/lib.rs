//! Remote data acquisition: the Zentao REST API or a read-only mirror of its MySQL database.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;
use zentao_core::{Connection, EntityFamily, IssueKind, SyncPolicy};
use zentao_storage::{FetchError, HttpClientConfig};

pub mod api;
pub mod mirror;

pub use api::ZentaoApiClient;
pub use mirror::RemoteDbSource;

pub const CRATE_NAME: &str = "zentao-sources";

/// Zentao action codes that link a commit to a task, story or bug.
pub const COMMIT_ACTIONS: [&str; 2] = ["gitcommited", "svncommited"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeParams {
    pub connection_id: u64,
    pub project_id: Option<i64>,
}

/// Parent record a dependent collection iterates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectInput {
    Execution(i64),
    Entity { kind: IssueKind, id: i64 },
}

#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'a> {
    pub family: EntityFamily,
    pub scope: &'a ScopeParams,
    pub input: Option<&'a CollectInput>,
    /// 1-based.
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest<'_> {
    fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }

    fn require_project(&self) -> Result<i64, FetchError> {
        self.scope.project_id.ok_or_else(|| {
            FetchError::Unsupported(format!("{} collection requires a project", self.family))
        })
    }

    fn require_execution(&self) -> Result<i64, FetchError> {
        match self.input {
            Some(CollectInput::Execution(id)) => Ok(*id),
            _ => Err(FetchError::Unsupported(format!(
                "{} collection requires an execution input",
                self.family
            ))),
        }
    }

    fn require_entity(&self) -> Result<(IssueKind, i64), FetchError> {
        match self.input {
            Some(CollectInput::Entity { kind, id }) => Ok((*kind, *id)),
            _ => Err(FetchError::Unsupported(format!(
                "{} collection requires an entity input",
                self.family
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub records: Vec<Value>,
    pub url: String,
    pub more: bool,
}

#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<Page, FetchError>;

    /// Releases pooled connections; later fetches fail.
    async fn release(&self);

    fn describe(&self) -> String;
}

/// The one acquisition strategy of a run, fixed at construction.
#[derive(Clone)]
pub enum DataAcquirer {
    Api(Arc<dyn PageSource>),
    RemoteDb(Arc<dyn PageSource>),
}

impl DataAcquirer {
    pub fn source(&self) -> &Arc<dyn PageSource> {
        match self {
            DataAcquirer::Api(source) | DataAcquirer::RemoteDb(source) => source,
        }
    }

    pub fn is_remote_db(&self) -> bool {
        matches!(self, DataAcquirer::RemoteDb(_))
    }

    pub async fn release(&self) {
        self.source().release().await;
    }
}

impl fmt::Debug for DataAcquirer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataAcquirer::Api(source) => f.debug_tuple("Api").field(&source.describe()).finish(),
            DataAcquirer::RemoteDb(source) => {
                f.debug_tuple("RemoteDb").field(&source.describe()).finish()
            }
        }
    }
}

/// Whether this run talks to a remote source at all.
#[derive(Debug, Clone)]
pub enum Collection {
    Active(DataAcquirer),
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbLogLevel {
    Silent,
    Error,
    Warn,
    Info,
}

impl DbLogLevel {
    pub fn level_filter(self) -> log::LevelFilter {
        match self {
            DbLogLevel::Silent => log::LevelFilter::Off,
            DbLogLevel::Error => log::LevelFilter::Error,
            DbLogLevel::Warn => log::LevelFilter::Warn,
            DbLogLevel::Info => log::LevelFilter::Info,
        }
    }
}

impl FromStr for DbLogLevel {
    type Err = AcquireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "silent" | "off" => Ok(DbLogLevel::Silent),
            "error" => Ok(DbLogLevel::Error),
            "warn" | "warning" => Ok(DbLogLevel::Warn),
            "info" => Ok(DbLogLevel::Info),
            other => Err(AcquireError::InvalidSetting(format!(
                "unknown database logging level {other:?}"
            ))),
        }
    }
}

/// Process-wide fallbacks for mirror settings a connection leaves unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDbDefaults {
    pub logging_level: String,
    pub idle_conns: u32,
    pub max_conns: u32,
}

impl Default for RemoteDbDefaults {
    fn default() -> Self {
        Self {
            logging_level: "error".to_string(),
            idle_conns: 10,
            max_conns: 10,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct RemoteDbSettings {
    pub url: String,
    pub logging_level: DbLogLevel,
    pub idle_conns: u32,
    pub max_conns: u32,
}

impl fmt::Debug for RemoteDbSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteDbSettings")
            .field("url", &"<redacted>")
            .field("logging_level", &self.logging_level)
            .field("idle_conns", &self.idle_conns)
            .field("max_conns", &self.max_conns)
            .finish()
    }
}

impl RemoteDbSettings {
    /// `None` when the connection has no mirror URL.
    pub fn resolve(
        connection: &Connection,
        defaults: &RemoteDbDefaults,
    ) -> Result<Option<Self>, AcquireError> {
        let Some(url) = connection.remote_db_url() else {
            return Ok(None);
        };
        let level = connection
            .db_logging_level
            .as_deref()
            .filter(|level| !level.trim().is_empty())
            .unwrap_or(&defaults.logging_level);
        // Zero means unset for both pool sizes.
        let max_conns = connection
            .db_max_conns
            .filter(|n| *n > 0)
            .unwrap_or(defaults.max_conns)
            .max(1);
        let idle_conns = connection
            .db_idle_conns
            .filter(|n| *n > 0)
            .unwrap_or(defaults.idle_conns)
            .min(max_conns);
        Ok(Some(Self {
            url: url.to_string(),
            logging_level: level.parse()?,
            idle_conns,
            max_conns,
        }))
    }
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("{0}")]
    InvalidSetting(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("api request failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("building http client: {0}")]
    Client(#[from] anyhow::Error),
    #[error("opening mirror database: {0}")]
    Database(#[from] sqlx::Error),
}

/// Opens remote sources; swapped for a recording fake in tests.
#[async_trait]
pub trait AcquirerFactory: Send + Sync {
    async fn open_remote_db(&self, settings: &RemoteDbSettings)
        -> Result<DataAcquirer, AcquireError>;

    async fn open_api(
        &self,
        connection: &Connection,
        http: &HttpClientConfig,
    ) -> Result<DataAcquirer, AcquireError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LiveAcquirerFactory;

#[async_trait]
impl AcquirerFactory for LiveAcquirerFactory {
    async fn open_remote_db(
        &self,
        settings: &RemoteDbSettings,
    ) -> Result<DataAcquirer, AcquireError> {
        let source = RemoteDbSource::connect(settings).await?;
        Ok(DataAcquirer::RemoteDb(Arc::new(source)))
    }

    async fn open_api(
        &self,
        connection: &Connection,
        http: &HttpClientConfig,
    ) -> Result<DataAcquirer, AcquireError> {
        let client = ZentaoApiClient::connect(connection, http.clone()).await?;
        Ok(DataAcquirer::Api(Arc::new(client)))
    }
}

/// Chooses and opens the acquisition strategy for one run.
///
/// Skip-collectors opens nothing. A mirror URL opens only the database pool; without one only
/// the API client is built.
pub async fn open_collection(
    policy: SyncPolicy,
    connection: &Connection,
    defaults: &RemoteDbDefaults,
    http: &HttpClientConfig,
    factory: &dyn AcquirerFactory,
) -> Result<Collection, AcquireError> {
    if policy.skip_collectors {
        info!(connection_id = connection.id, "collectors skipped; no remote source opened");
        return Ok(Collection::Skipped);
    }

    let acquirer = match RemoteDbSettings::resolve(connection, defaults)? {
        Some(settings) => {
            info!(
                connection_id = connection.id,
                max_conns = settings.max_conns,
                "opening mirror database"
            );
            factory.open_remote_db(&settings).await?
        }
        None => {
            info!(connection_id = connection.id, endpoint = %connection.endpoint, "opening api client");
            factory.open_api(connection, http).await?
        }
    };
    Ok(Collection::Active(acquirer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct NullSource;

    #[async_trait]
    impl PageSource for NullSource {
        async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<Page, FetchError> {
            Err(FetchError::Unsupported(request.family.to_string()))
        }

        async fn release(&self) {}

        fn describe(&self) -> String {
            "null".into()
        }
    }

    #[derive(Default)]
    struct RecordingFactory {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AcquirerFactory for RecordingFactory {
        async fn open_remote_db(
            &self,
            settings: &RemoteDbSettings,
        ) -> Result<DataAcquirer, AcquireError> {
            self.calls.lock().unwrap().push(format!(
                "db:{:?}:{}:{}",
                settings.logging_level, settings.idle_conns, settings.max_conns
            ));
            Ok(DataAcquirer::RemoteDb(Arc::new(NullSource)))
        }

        async fn open_api(
            &self,
            connection: &Connection,
            _http: &HttpClientConfig,
        ) -> Result<DataAcquirer, AcquireError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("api:{}", connection.endpoint));
            Ok(DataAcquirer::Api(Arc::new(NullSource)))
        }
    }

    fn connection(db_url: Option<&str>) -> Connection {
        Connection {
            id: 1,
            endpoint: "http://zentao.local/api.php/v1/".into(),
            db_url: db_url.map(str::to_string),
            ..Default::default()
        }
    }

    async fn open(policy: SyncPolicy, connection: &Connection) -> (Collection, Vec<String>) {
        let factory = RecordingFactory::default();
        let collection = open_collection(
            policy,
            connection,
            &RemoteDbDefaults::default(),
            &HttpClientConfig::default(),
            &factory,
        )
        .await
        .expect("collection");
        let calls = factory.calls.lock().unwrap().clone();
        (collection, calls)
    }

    #[tokio::test]
    async fn mirror_url_opens_only_the_database() {
        let (collection, calls) =
            open(SyncPolicy::default(), &connection(Some("mysql://ro@db/zentao"))).await;
        assert!(matches!(collection, Collection::Active(ref acq) if acq.is_remote_db()));
        assert_eq!(calls, vec!["db:Error:10:10".to_string()]);
    }

    #[tokio::test]
    async fn no_mirror_url_opens_only_the_api_client() {
        let (collection, calls) = open(SyncPolicy::default(), &connection(None)).await;
        assert!(matches!(collection, Collection::Active(DataAcquirer::Api(_))));
        assert_eq!(calls, vec!["api:http://zentao.local/api.php/v1/".to_string()]);
    }

    #[tokio::test]
    async fn skip_collectors_opens_nothing() {
        let policy = SyncPolicy {
            skip_collectors: true,
        };
        let (collection, calls) = open(policy, &connection(Some("mysql://ro@db/zentao"))).await;
        assert!(matches!(collection, Collection::Skipped));
        assert!(calls.is_empty());
    }

    #[test]
    fn connection_settings_override_process_defaults() {
        let mut conn = connection(Some("mysql://ro@db/zentao"));
        conn.db_logging_level = Some("info".into());
        conn.db_max_conns = Some(4);
        let settings = RemoteDbSettings::resolve(&conn, &RemoteDbDefaults::default())
            .unwrap()
            .unwrap();
        assert_eq!(settings.logging_level, DbLogLevel::Info);
        assert_eq!(settings.max_conns, 4);
        // idle falls back to the default and is capped by max
        assert_eq!(settings.idle_conns, 4);
        assert!(!format!("{settings:?}").contains("mysql://"));
    }

    #[test]
    fn zero_pool_sizes_fall_back_to_process_defaults() {
        let mut conn = connection(Some("mysql://ro@db/zentao"));
        conn.db_idle_conns = Some(0);
        conn.db_max_conns = Some(0);
        let defaults = RemoteDbDefaults {
            idle_conns: 10,
            max_conns: 20,
            ..Default::default()
        };
        let settings = RemoteDbSettings::resolve(&conn, &defaults).unwrap().unwrap();
        assert_eq!((settings.idle_conns, settings.max_conns), (10, 20));
    }

    #[test]
    fn unknown_logging_level_is_rejected() {
        let mut conn = connection(Some("mysql://ro@db/zentao"));
        conn.db_logging_level = Some("chatty".into());
        let err = RemoteDbSettings::resolve(&conn, &RemoteDbDefaults::default()).unwrap_err();
        assert!(matches!(err, AcquireError::InvalidSetting(_)));
        assert_eq!("Silent".parse::<DbLogLevel>().unwrap(), DbLogLevel::Silent);
    }

    #[test]
    fn collect_inputs_round_trip_through_raw_rows() {
        let input = CollectInput::Entity {
            kind: IssueKind::Bug,
            id: 9,
        };
        let value = serde_json::to_value(input).unwrap();
        assert_eq!(value, serde_json::json!({"entity": {"kind": "bug", "id": 9}}));
        assert_eq!(serde_json::from_value::<CollectInput>(value).unwrap(), input);
    }
}
