use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::auth::{AuthError, TokenIssuer};
use crate::config::Config;
use crate::model::{Discussion, PaginationState, Topic};

/// One page of topics as returned by the server, plus the authoritative
/// drifting-idea count for the whole discussion.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TopicPage {
    #[serde(default)]
    pub rows: Vec<Topic>,
    #[serde(default)]
    pub page_count: u32,
    #[serde(default)]
    pub total_row_count: u64,
    #[serde(default)]
    pub unclustered_count: u64,
}

/// A fetched page tagged with its request sequence number. The commit site
/// must drop snapshots whose sequence is no longer current.
#[derive(Debug, Clone)]
pub struct TopicSnapshot {
    pub seq: u64,
    pub page: TopicPage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdeaAck {
    #[serde(default)]
    pub idea_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ParticipationTokenResponse {
    participation_token: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid api configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("discussion not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("rate limited")]
    RateLimited,
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("participation token unavailable: {0}")]
    Token(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::NOT_FOUND => ApiError::NotFound,
            StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
            StatusCode::FORBIDDEN => ApiError::Forbidden,
            StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited,
            other => ApiError::HttpStatus(other),
        }
    }
}

/// REST seam; the reqwest implementation is swapped for mocks in tests.
#[async_trait]
pub trait ApiBackend: Send + Sync {
    async fn get_discussion(&self, base_url: &Url, discussion_id: &str)
        -> Result<Discussion, ApiError>;

    async fn get_topics(
        &self,
        base_url: &Url,
        discussion_id: &str,
        query: &[(String, String)],
    ) -> Result<TopicPage, ApiError>;

    async fn submit_idea(
        &self,
        base_url: &Url,
        discussion_id: &str,
        text: &str,
        participation_token: Option<&str>,
    ) -> Result<IdeaAck, ApiError>;

    async fn trigger_clustering(&self, base_url: &Url, discussion_id: &str)
        -> Result<(), ApiError>;

    async fn initiate_anonymous(
        &self,
        base_url: &Url,
        discussion_id: &str,
        api_key: &str,
    ) -> Result<String, ApiError>;
}

pub struct ReqwestApiBackend {
    client: reqwest::Client,
}

impl ReqwestApiBackend {
    pub fn new() -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }
}

fn endpoint(base_url: &Url, path: &str) -> Result<Url, ApiError> {
    base_url
        .join(path)
        .map_err(|err| ApiError::InvalidConfig(format!("invalid endpoint {path}: {err}")))
}

#[async_trait]
impl ApiBackend for ReqwestApiBackend {
    async fn get_discussion(
        &self,
        base_url: &Url,
        discussion_id: &str,
    ) -> Result<Discussion, ApiError> {
        let url = endpoint(base_url, &format!("discussions/{discussion_id}"))?;
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ApiError::from_status(response.status()));
        }
        Ok(response.json::<Discussion>().await?)
    }

    async fn get_topics(
        &self,
        base_url: &Url,
        discussion_id: &str,
        query: &[(String, String)],
    ) -> Result<TopicPage, ApiError> {
        let url = endpoint(base_url, &format!("discussions/{discussion_id}/topics"))?;
        let response = self.client.get(url).query(query).send().await?;
        if !response.status().is_success() {
            return Err(ApiError::from_status(response.status()));
        }
        Ok(response.json::<TopicPage>().await?)
    }

    async fn submit_idea(
        &self,
        base_url: &Url,
        discussion_id: &str,
        text: &str,
        participation_token: Option<&str>,
    ) -> Result<IdeaAck, ApiError> {
        let url = endpoint(base_url, &format!("discussions/{discussion_id}/ideas"))?;
        let mut builder = self.client.post(url).json(&serde_json::json!({ "text": text }));
        if let Some(token) = participation_token {
            builder = builder.header("X-Participation-Token", token);
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(ApiError::from_status(response.status()));
        }
        Ok(response.json::<IdeaAck>().await?)
    }

    async fn trigger_clustering(
        &self,
        base_url: &Url,
        discussion_id: &str,
    ) -> Result<(), ApiError> {
        let url = endpoint(base_url, &format!("discussions/{discussion_id}/cluster"))?;
        let response = self.client.post(url).send().await?;
        if !response.status().is_success() {
            return Err(ApiError::from_status(response.status()));
        }
        Ok(())
    }

    async fn initiate_anonymous(
        &self,
        base_url: &Url,
        discussion_id: &str,
        api_key: &str,
    ) -> Result<String, ApiError> {
        let url = endpoint(
            base_url,
            &format!("discussions/{discussion_id}/initiate-anonymous"),
        )?;
        let response = self
            .client
            .post(url)
            .header("X-API-Key", api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ApiError::from_status(response.status()));
        }
        let payload = response.json::<ParticipationTokenResponse>().await?;
        Ok(payload.participation_token)
    }
}

/// Maps view pagination state to the wire query: page becomes one-based,
/// sort direction an explicit token, filters `filter.<field>.<op>=<value>`.
pub fn topic_query(pagination: &PaginationState) -> Vec<(String, String)> {
    let mut query = vec![
        ("page".to_string(), (pagination.page + 1).to_string()),
        ("page_size".to_string(), pagination.page_size.to_string()),
        ("sort".to_string(), pagination.sort_field.clone()),
        (
            "sort_dir".to_string(),
            pagination.sort_direction.as_str().to_string(),
        ),
    ];
    let search = pagination.search.trim();
    if !search.is_empty() {
        query.push(("search".to_string(), search.to_string()));
    }
    for filter in &pagination.filters {
        query.push((
            format!("filter.{}.{}", filter.field, filter.op),
            filter.value.clone(),
        ));
    }
    query
}

/// REST client for one server. Topic fetches carry a monotonically
/// increasing sequence so stale completions can be recognized and dropped.
pub struct ApiClient {
    config: Config,
    backend: Arc<dyn ApiBackend>,
    topic_seq: AtomicU64,
}

impl ApiClient {
    pub fn new(config: Config) -> Result<Self, ApiError> {
        let backend = Arc::new(ReqwestApiBackend::new()?);
        Ok(Self::with_backend(config, backend))
    }

    pub fn with_backend(config: Config, backend: Arc<dyn ApiBackend>) -> Self {
        Self {
            config,
            backend,
            topic_seq: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn fetch_discussion(&self, discussion_id: &str) -> Result<Discussion, ApiError> {
        self.backend
            .get_discussion(self.config.base_url(), discussion_id)
            .await
    }

    /// Fetch one topic page. The returned snapshot is current only while no
    /// newer fetch has been started; check [`ApiClient::is_current`] before
    /// committing it.
    pub async fn fetch_topics(
        &self,
        discussion_id: &str,
        pagination: &PaginationState,
    ) -> Result<TopicSnapshot, ApiError> {
        let seq = self.topic_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let query = topic_query(pagination);
        let page = self
            .backend
            .get_topics(self.config.base_url(), discussion_id, &query)
            .await?;
        Ok(TopicSnapshot { seq, page })
    }

    /// True while `seq` belongs to the most recently started topic fetch.
    pub fn is_current(&self, seq: u64) -> bool {
        self.topic_seq.load(Ordering::SeqCst) == seq
    }

    /// Invalidate all in-flight topic fetches; used on view teardown.
    pub fn supersede_all(&self) {
        self.topic_seq.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn submit_idea(
        &self,
        discussion_id: &str,
        text: &str,
        participation_token: Option<&str>,
    ) -> Result<IdeaAck, ApiError> {
        self.backend
            .submit_idea(
                self.config.base_url(),
                discussion_id,
                text,
                participation_token,
            )
            .await
    }

    pub async fn trigger_clustering(&self, discussion_id: &str) -> Result<(), ApiError> {
        self.backend
            .trigger_clustering(self.config.base_url(), discussion_id)
            .await
    }
}

#[async_trait]
impl TokenIssuer for ApiClient {
    async fn issue_token(&self, discussion_id: &str) -> Result<String, AuthError> {
        let api_key = self
            .config
            .api_key()
            .ok_or_else(|| AuthError::Issuance("no api key configured".into()))?;
        self.backend
            .initiate_anonymous(self.config.base_url(), discussion_id, api_key)
            .await
            .map_err(|err| match err {
                ApiError::Unauthorized => AuthError::Unauthorized,
                ApiError::Network(inner) => AuthError::Network(inner.to_string()),
                other => AuthError::Issuance(other.to_string()),
            })
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockApiBackend;
    use super::*;
    use crate::model::{FilterPredicate, SortDirection};

    fn test_client(backend: Arc<MockApiBackend>) -> ApiClient {
        let config = Config::new("http://localhost:8080").unwrap();
        ApiClient::with_backend(config, backend)
    }

    #[test]
    fn topic_query_maps_zero_based_page_to_one_based() {
        let pagination = PaginationState {
            page: 2,
            page_size: 25,
            sort_field: "count".into(),
            sort_direction: SortDirection::Asc,
            search: String::new(),
            filters: Vec::new(),
        };
        let query = topic_query(&pagination);
        assert!(query.contains(&("page".to_string(), "3".to_string())));
        assert!(query.contains(&("page_size".to_string(), "25".to_string())));
        assert!(query.contains(&("sort_dir".to_string(), "asc".to_string())));
        assert!(!query.iter().any(|(k, _)| k == "search"));
    }

    #[test]
    fn topic_query_namespaces_filters() {
        let pagination = PaginationState {
            search: " climate ".into(),
            filters: vec![FilterPredicate {
                field: "count".into(),
                op: "gte".into(),
                value: "5".into(),
            }],
            ..PaginationState::default()
        };
        let query = topic_query(&pagination);
        assert!(query.contains(&("search".to_string(), "climate".to_string())));
        assert!(query.contains(&("filter.count.gte".to_string(), "5".to_string())));
    }

    #[tokio::test]
    async fn newer_fetch_supersedes_older_sequence() {
        let backend = Arc::new(MockApiBackend::new());
        backend.push_page(TopicPage {
            rows: vec![],
            page_count: 1,
            total_row_count: 0,
            unclustered_count: 0,
        });
        backend.push_page(TopicPage {
            rows: vec![],
            page_count: 2,
            total_row_count: 40,
            unclustered_count: 0,
        });
        let client = test_client(backend);

        let a = client
            .fetch_topics("d1", &PaginationState::default())
            .await
            .unwrap();
        let b = client
            .fetch_topics("d1", &PaginationState::default())
            .await
            .unwrap();

        assert!(!client.is_current(a.seq));
        assert!(client.is_current(b.seq));
    }

    #[tokio::test]
    async fn supersede_all_invalidates_latest_fetch() {
        let backend = Arc::new(MockApiBackend::new());
        backend.push_page(TopicPage {
            rows: vec![],
            page_count: 1,
            total_row_count: 0,
            unclustered_count: 0,
        });
        let client = test_client(backend);

        let snapshot = client
            .fetch_topics("d1", &PaginationState::default())
            .await
            .unwrap();
        client.supersede_all();
        assert!(!client.is_current(snapshot.seq));
    }

    #[tokio::test]
    async fn missing_discussion_maps_to_not_found() {
        let backend = Arc::new(MockApiBackend::new());
        let client = test_client(backend);
        let err = client.fetch_discussion("nope").await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound));
    }

    #[tokio::test]
    async fn submit_idea_forwards_participation_token() {
        let backend = Arc::new(MockApiBackend::new());
        let client = test_client(backend.clone());

        client
            .submit_idea("d1", "an idea", Some("tok-1"))
            .await
            .unwrap();

        let submitted = backend.submitted.lock();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].1.as_deref(), Some("tok-1"));
    }

    #[tokio::test]
    async fn token_issuance_requires_api_key() {
        let backend = Arc::new(MockApiBackend::new());
        let config = Config::new("http://localhost:8080").unwrap();
        let client = ApiClient::with_backend(config, backend.clone());

        let err = client.issue_token("d1").await.unwrap_err();
        assert!(matches!(err, AuthError::Issuance(_)));

        let config = Config::new("http://localhost:8080")
            .unwrap()
            .with_api_key(Some("key".into()));
        let client = ApiClient::with_backend(config, backend);
        let token = client.issue_token("d1").await.unwrap();
        assert_eq!(token, "anon-1");
    }
}
