use serde::{Deserialize, Serialize};

/// Per-target vector weights for multi-target hybrid search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetWeights {
    pub profile: f64,
    pub hashtag: f64,
    pub post: f64,
}

impl Default for TargetWeights {
    fn default() -> Self {
        Self {
            profile: 2.5,
            hashtag: 1.5,
            post: 1.0,
        }
    }
}

/// A hybrid (dense + lexical) search request.
#[derive(Debug, Clone)]
pub struct HybridQuery {
    /// The keyword text for the BM25 side of the hybrid search
    pub query: String,
    /// Dense vector for the semantic side
    pub vector: Vec<f32>,
    /// Dense/lexical mix: 1.0 is pure vector, 0.0 pure keyword
    pub alpha: f64,
    pub limit: u32,
    /// Optional `platform` equality filter
    pub platform: Option<String>,
    pub min_followers: Option<u64>,
    pub max_followers: Option<u64>,
    pub target_weights: TargetWeights,
}

/// One object returned from a hybrid search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    pub distance: Option<f64>,
    pub profile_url: String,
    pub platform: Option<String>,
    pub display_name: Option<String>,
    pub biography: Option<String>,
    pub followers: Option<i64>,
}

// Raw GraphQL response shapes. `_additional.score` comes back as a string.

#[derive(Debug, Deserialize)]
pub(crate) struct GraphQLResponse {
    pub data: Option<serde_json::Value>,
    pub errors: Option<Vec<GraphQLError>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GraphQLError {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawObject {
    #[serde(rename = "_additional")]
    pub additional: RawAdditional,
    pub profile_url: Option<String>,
    pub platform: Option<String>,
    pub display_name: Option<String>,
    pub biography: Option<String>,
    pub followers: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawAdditional {
    pub id: String,
    #[serde(default)]
    pub score: Option<serde_json::Value>,
    #[serde(default)]
    pub distance: Option<f64>,
}

impl RawObject {
    pub(crate) fn into_hit(self) -> Option<SearchHit> {
        let profile_url = self.profile_url?;
        let score = match self.additional.score {
            Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0.0),
            Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            _ => 0.0,
        };
        Some(SearchHit {
            id: self.additional.id,
            score,
            distance: self.additional.distance,
            profile_url,
            platform: self.platform,
            display_name: self.display_name,
            biography: self.biography,
            followers: self.followers,
        })
    }
}
