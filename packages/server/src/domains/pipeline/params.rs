//! Search request validation.
//!
//! `SearchRequest` is the wire shape; `validate()` resolves defaults and
//! bounds into the `SearchParams` stored on the job row and interpreted by
//! the engine.

use serde::{Deserialize, Serialize};

use crate::common::Platform;

pub const DEFAULT_TOP_N: u32 = 30;
pub const DEFAULT_WEAVIATE_TOP_N: u32 = 500;

/// Raw submit body as received over the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub business_description: String,
    pub top_n: Option<u32>,
    pub weaviate_top_n: Option<u32>,
    pub llm_top_n: Option<u32>,
    pub min_followers: Option<u64>,
    pub max_followers: Option<u64>,
    pub platform: Option<String>,
    #[serde(default)]
    pub exclude_profile_urls: Vec<String>,
    #[serde(default)]
    pub strict_location_matching: bool,
}

/// Validated, default-resolved job parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParams {
    pub business_description: String,
    pub top_n: u32,
    pub weaviate_top_n: u32,
    pub llm_top_n: u32,
    pub min_followers: Option<u64>,
    pub max_followers: Option<u64>,
    pub platform: Option<Platform>,
    pub exclude_profile_urls: Vec<String>,
    pub strict_location_matching: bool,
}

impl SearchRequest {
    /// Validate bounds and resolve defaults. `llm_top_n` defaults to `top_n`
    /// and may never exceed `weaviate_top_n`.
    pub fn validate(self) -> Result<SearchParams, String> {
        let description = self.business_description.trim().to_string();
        if description.is_empty() {
            return Err("business_description must not be empty".into());
        }

        let top_n = self.top_n.unwrap_or(DEFAULT_TOP_N);
        if !(1..=1000).contains(&top_n) {
            return Err("top_n must be between 1 and 1000".into());
        }

        let weaviate_top_n = self.weaviate_top_n.unwrap_or(DEFAULT_WEAVIATE_TOP_N);
        if !(10..=5000).contains(&weaviate_top_n) {
            return Err("weaviate_top_n must be between 10 and 5000".into());
        }

        let llm_top_n = self.llm_top_n.unwrap_or(top_n);
        if !(1..=1000).contains(&llm_top_n) {
            return Err("llm_top_n must be between 1 and 1000".into());
        }
        if llm_top_n > weaviate_top_n {
            return Err("llm_top_n must not exceed weaviate_top_n".into());
        }

        if let (Some(min), Some(max)) = (self.min_followers, self.max_followers) {
            if min > max {
                return Err("min_followers must not exceed max_followers".into());
            }
        }

        let platform = match &self.platform {
            Some(raw) => Some(
                Platform::parse(raw)
                    .ok_or_else(|| format!("unknown platform '{raw}' (instagram or tiktok)"))?,
            ),
            None => None,
        };

        Ok(SearchParams {
            business_description: description,
            top_n,
            weaviate_top_n,
            llm_top_n,
            min_followers: self.min_followers,
            max_followers: self.max_followers,
            platform,
            exclude_profile_urls: self.exclude_profile_urls,
            strict_location_matching: self.strict_location_matching,
        })
    }
}
