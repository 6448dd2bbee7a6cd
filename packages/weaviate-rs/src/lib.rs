//! Pure Weaviate client for hybrid search.
//!
//! A minimal client for the Weaviate GraphQL API. Supports a readiness check
//! and multi-target hybrid (dense + BM25) search with platform and follower
//! filters.
//!
//! # Example
//!
//! ```rust,ignore
//! use weaviate::{WeaviateClient, HybridQuery, TargetWeights};
//!
//! let client = WeaviateClient::new("http://localhost:8080".into(), None, "Creator".into());
//!
//! let hits = client.hybrid_search(&HybridQuery {
//!     query: "specialty coffee".into(),
//!     vector: embedding,
//!     alpha: 0.5,
//!     limit: 500,
//!     platform: Some("instagram".into()),
//!     min_followers: Some(10_000),
//!     max_followers: None,
//!     target_weights: TargetWeights::default(),
//! }).await?;
//! ```

pub mod error;
pub mod types;

pub use error::{Result, WeaviateError};
pub use types::{HybridQuery, SearchHit, TargetWeights};

use std::fmt::Write as _;
use std::time::Duration;

use types::{GraphQLResponse, RawObject};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

pub struct WeaviateClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    collection: String,
    timeout: Duration,
}

impl WeaviateClient {
    pub fn new(base_url: String, api_key: Option<String>, collection: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            collection,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the per-request timeout (default 120s).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Readiness probe against `/v1/.well-known/ready`.
    pub async fn ready(&self) -> bool {
        let url = format!("{}/v1/.well-known/ready", self.base_url);
        let mut req = self.client.get(&url).timeout(Duration::from_secs(5));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        match req.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::warn!(error = %e, "Weaviate readiness check failed");
                false
            }
        }
    }

    /// Run a multi-target hybrid search.
    ///
    /// Objects without a `profile_url` are dropped from the result.
    pub async fn hybrid_search(&self, query: &HybridQuery) -> Result<Vec<SearchHit>> {
        let gql = self.build_query(query);
        let url = format!("{}/v1/graphql", self.base_url);

        let mut req = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&serde_json::json!({ "query": gql }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(WeaviateError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let parsed: GraphQLResponse = resp.json().await?;
        if let Some(errors) = parsed.errors {
            let messages: Vec<_> = errors.into_iter().map(|e| e.message).collect();
            return Err(WeaviateError::GraphQL(messages.join("; ")));
        }

        let objects = parsed
            .data
            .and_then(|d| {
                d.pointer(&format!("/Get/{}", self.collection))
                    .cloned()
            })
            .ok_or_else(|| WeaviateError::Parse("missing Get payload".into()))?;

        let raw: Vec<RawObject> = serde_json::from_value(objects)
            .map_err(|e| WeaviateError::Parse(e.to_string()))?;

        Ok(raw.into_iter().filter_map(RawObject::into_hit).collect())
    }

    fn build_query(&self, query: &HybridQuery) -> String {
        // serde_json handles string escaping for the keyword text
        let escaped_query = serde_json::to_string(&query.query).unwrap_or_default();
        let vector = serde_json::to_string(&query.vector).unwrap_or_default();
        let w = query.target_weights;

        let mut operands = Vec::new();
        if let Some(platform) = &query.platform {
            operands.push(format!(
                r#"{{path: ["platform"], operator: Equal, valueText: {}}}"#,
                serde_json::to_string(platform).unwrap_or_default()
            ));
        }
        if let Some(min) = query.min_followers {
            operands.push(format!(
                r#"{{path: ["followers"], operator: GreaterThanEqual, valueInt: {min}}}"#
            ));
        }
        if let Some(max) = query.max_followers {
            operands.push(format!(
                r#"{{path: ["followers"], operator: LessThanEqual, valueInt: {max}}}"#
            ));
        }

        let mut gql = String::new();
        let _ = write!(gql, "{{ Get {{ {}(", self.collection);
        let _ = write!(gql, "limit: {}", query.limit);
        let _ = write!(
            gql,
            ", hybrid: {{query: {escaped_query}, vector: {vector}, alpha: {}, \
             targets: {{targetVectors: [\"profile\", \"hashtag\", \"post\"], \
             combinationMethod: relativeScore, \
             weights: {{profile: {}, hashtag: {}, post: {}}}}}}}",
            query.alpha, w.profile, w.hashtag, w.post
        );
        if !operands.is_empty() {
            let _ = write!(
                gql,
                ", where: {{operator: And, operands: [{}]}}",
                operands.join(", ")
            );
        }
        let _ = write!(
            gql,
            ") {{ profile_url platform display_name biography followers \
             _additional {{ id score distance }} }} }} }}"
        );
        gql
    }
}
