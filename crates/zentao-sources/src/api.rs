use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;
use zentao_core::{Connection, EntityFamily, IssueKind};
use zentao_storage::{FetchError, HttpClientConfig, HttpFetcher, RateLimit};

use crate::{AcquireError, Page, PageRequest, PageSource, COMMIT_ACTIONS};

/// Token-authenticated client for the Zentao `api.php/v1` REST API.
#[derive(Debug)]
pub struct ZentaoApiClient {
    fetcher: HttpFetcher,
    base: String,
    token: HeaderValue,
}

/// How a family's response body is shaped.
enum Listing {
    /// `{"<key>": [...], "page": n, "limit": m, "total": t}`
    Paged(&'static str),
    /// Unpaginated array, either top-level or under `key`.
    Array(&'static str),
    /// One detail object.
    Single,
    /// Commit-link entries among the `actions` of a detail object.
    CommitActions,
}

pub(crate) fn normalize_endpoint(endpoint: &str) -> Result<String, AcquireError> {
    let invalid = |reason: String| AcquireError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return Err(invalid("endpoint is empty".into()));
    }
    let url = Url::parse(trimmed).map_err(|err| invalid(err.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    let mut base = url.to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Ok(base)
}

impl ZentaoApiClient {
    /// Builds the rate-limited client and exchanges the connection credentials for a token.
    pub async fn connect(
        connection: &Connection,
        mut http: HttpClientConfig,
    ) -> Result<Self, AcquireError> {
        let base = normalize_endpoint(&connection.endpoint)?;
        if http.rate_limit.is_none() {
            http.rate_limit = RateLimit::per_hour(connection.rate_limit_per_hour);
        }
        let fetcher = HttpFetcher::new(connection.id.to_string(), http)?;

        let body = json!({"account": connection.username, "password": connection.password});
        let resp = fetcher
            .post_json(&format!("{base}tokens"), &body)
            .await?;
        let token = resp
            .json()?
            .get("token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AcquireError::Auth("token response carries no token".into()))?;
        let token = HeaderValue::from_str(&token)
            .map_err(|err| AcquireError::Auth(format!("token is not a valid header: {err}")))?;

        debug!(connection_id = connection.id, "api token acquired");
        Ok(Self {
            fetcher,
            base,
            token,
        })
    }

    fn route(&self, request: &PageRequest<'_>) -> Result<(String, Listing), FetchError> {
        let route = match request.family {
            EntityFamily::Account => ("users".to_string(), Listing::Paged("users")),
            EntityFamily::Department => ("departments".to_string(), Listing::Array("departments")),
            EntityFamily::ExecutionSummary => (
                format!("projects/{}/executions", request.require_project()?),
                Listing::Paged("executions"),
            ),
            EntityFamily::ExecutionSummaryDev => {
                request.require_project()?;
                ("executions".to_string(), Listing::Paged("executions"))
            }
            EntityFamily::Execution => (
                format!("executions/{}", request.require_execution()?),
                Listing::Single,
            ),
            EntityFamily::Task => (
                format!("executions/{}/tasks", request.require_execution()?),
                Listing::Paged("tasks"),
            ),
            EntityFamily::Story => (
                format!("projects/{}/stories", request.require_project()?),
                Listing::Paged("stories"),
            ),
            EntityFamily::ExecutionStory => (
                format!("executions/{}/stories", request.require_execution()?),
                Listing::Paged("stories"),
            ),
            EntityFamily::Bug => (
                format!("projects/{}/bugs", request.require_project()?),
                Listing::Paged("bugs"),
            ),
            EntityFamily::TaskCommit | EntityFamily::StoryCommit | EntityFamily::BugCommit => {
                let (kind, id) = request.require_entity()?;
                let collection = match kind {
                    IssueKind::Task => "tasks",
                    IssueKind::Story => "stories",
                    IssueKind::Bug => "bugs",
                };
                (format!("{collection}/{id}"), Listing::CommitActions)
            }
            EntityFamily::TaskWorklog => {
                let (_, id) = request.require_entity()?;
                (format!("tasks/{id}/estimate"), Listing::Array("effort"))
            }
            EntityFamily::Project
            | EntityFamily::TaskRepoCommit
            | EntityFamily::StoryRepoCommit
            | EntityFamily::BugRepoCommit
            | EntityFamily::Changelog => {
                return Err(FetchError::Unsupported(format!(
                    "{} is not available from the api",
                    request.family
                )))
            }
        };
        Ok(route)
    }
}

fn array_at(body: &Value, key: &str) -> Vec<Value> {
    body.get(key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn is_commit_action(action: &Value) -> bool {
    action
        .get("action")
        .and_then(Value::as_str)
        .is_some_and(|code| COMMIT_ACTIONS.contains(&code.trim().to_ascii_lowercase().as_str()))
}

/// Next-page decision: trust `total` when present, otherwise a full page means more.
fn has_more(body: &Value, page: u32, page_size: u32, returned: usize) -> bool {
    if returned == 0 {
        return false;
    }
    match body.get("total").and_then(Value::as_u64) {
        Some(total) => u64::from(page) * u64::from(page_size) < total,
        None => returned >= page_size as usize,
    }
}

#[async_trait]
impl PageSource for ZentaoApiClient {
    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<Page, FetchError> {
        let (path, listing) = self.route(request)?;
        let url = match listing {
            Listing::Paged(_) => format!(
                "{}{path}?page={}&limit={}",
                self.base, request.page, request.page_size
            ),
            _ => format!("{}{path}", self.base),
        };

        let mut headers = HeaderMap::new();
        headers.insert("Token", self.token.clone());
        let body = self.fetcher.get(&url, headers).await?.json()?;

        let page = match listing {
            Listing::Paged(key) => {
                let records = array_at(&body, key);
                let more = has_more(&body, request.page, request.page_size, records.len());
                Page { records, url, more }
            }
            Listing::Array(key) => {
                let records = match body {
                    Value::Array(items) => items,
                    other => array_at(&other, key),
                };
                Page {
                    records,
                    url,
                    more: false,
                }
            }
            Listing::Single => Page {
                records: vec![body],
                url,
                more: false,
            },
            Listing::CommitActions => Page {
                records: array_at(&body, "actions")
                    .into_iter()
                    .filter(is_commit_action)
                    .collect(),
                url,
                more: false,
            },
        };
        Ok(page)
    }

    async fn release(&self) {
        self.fetcher.shutdown();
    }

    fn describe(&self) -> String {
        format!("zentao api at {}", self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CollectInput, ScopeParams};
    use std::time::Duration;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use zentao_storage::RetryPolicy;

    async fn client_for(server: &MockServer) -> ZentaoApiClient {
        Mock::given(method("POST"))
            .and(path("/api.php/v1/tokens"))
            .and(body_json(json!({"account": "admin", "password": "pw"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"token": "t0k"})))
            .expect(1)
            .mount(server)
            .await;

        let connection = Connection {
            id: 1,
            endpoint: format!("{}/api.php/v1/", server.uri()),
            username: "admin".into(),
            password: "pw".into(),
            rate_limit_per_hour: 360_000,
            ..Default::default()
        };
        let http = HttpClientConfig {
            retry: RetryPolicy {
                retries: 1,
                first_delay: Duration::from_millis(1),
                ceiling: Duration::from_millis(1),
            },
            ..Default::default()
        };
        ZentaoApiClient::connect(&connection, http).await.expect("client")
    }

    #[test]
    fn endpoint_must_be_an_http_url() {
        assert!(normalize_endpoint("").is_err());
        assert!(normalize_endpoint("not a url").is_err());
        assert!(normalize_endpoint("ftp://zentao/api.php/v1").is_err());
        assert_eq!(
            normalize_endpoint("http://zentao.local/api.php/v1").unwrap(),
            "http://zentao.local/api.php/v1/"
        );
    }

    #[tokio::test]
    async fn paged_listing_follows_total() {
        let server = MockServer::start().await;
        let client = client_for(&server).await;
        Mock::given(method("GET"))
            .and(path("/api.php/v1/projects/3/bugs"))
            .and(query_param("page", "1"))
            .and(query_param("limit", "2"))
            .and(header("Token", "t0k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "page": 1, "limit": 2, "total": 3,
                "bugs": [{"id": 1}, {"id": 2}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api.php/v1/projects/3/bugs"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "page": 2, "limit": 2, "total": 3,
                "bugs": [{"id": 3}]
            })))
            .mount(&server)
            .await;

        let scope = ScopeParams {
            connection_id: 1,
            project_id: Some(3),
        };
        let mut request = PageRequest {
            family: EntityFamily::Bug,
            scope: &scope,
            input: None,
            page: 1,
            page_size: 2,
        };
        let first = client.fetch_page(&request).await.expect("page 1");
        assert_eq!(first.records.len(), 2);
        assert!(first.more);

        request.page = 2;
        let second = client.fetch_page(&request).await.expect("page 2");
        assert_eq!(second.records, vec![json!({"id": 3})]);
        assert!(!second.more);
    }

    #[tokio::test]
    async fn commit_collection_keeps_only_commit_actions() {
        let server = MockServer::start().await;
        let client = client_for(&server).await;
        Mock::given(method("GET"))
            .and(path("/api.php/v1/tasks/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 42,
                "actions": [
                    {"id": 1, "action": "opened"},
                    {"id": 2, "action": "gitcommited", "extra": "abc"},
                ]
            })))
            .mount(&server)
            .await;

        let scope = ScopeParams {
            connection_id: 1,
            project_id: Some(3),
        };
        let input = CollectInput::Entity {
            kind: IssueKind::Task,
            id: 42,
        };
        let page = client
            .fetch_page(&PageRequest {
                family: EntityFamily::TaskCommit,
                scope: &scope,
                input: Some(&input),
                page: 1,
                page_size: 100,
            })
            .await
            .expect("page");
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0]["id"], 2);
        assert!(!page.more);
    }

    #[tokio::test]
    async fn changelogs_are_not_served_by_the_api() {
        let server = MockServer::start().await;
        let client = client_for(&server).await;
        let scope = ScopeParams {
            connection_id: 1,
            project_id: Some(3),
        };
        let err = client
            .fetch_page(&PageRequest {
                family: EntityFamily::Changelog,
                scope: &scope,
                input: None,
                page: 1,
                page_size: 100,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Unsupported(_)));
    }

    #[tokio::test]
    async fn missing_token_fails_authentication() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api.php/v1/tokens"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "bad"})))
            .mount(&server)
            .await;
        let connection = Connection {
            id: 1,
            endpoint: format!("{}/api.php/v1", server.uri()),
            ..Default::default()
        };
        let err = ZentaoApiClient::connect(&connection, HttpClientConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::Auth(_)));
    }
}
