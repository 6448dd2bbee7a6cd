//! Stage 1: expand the business description into keyword queries.
//!
//! One scoring-model call produces a small ordered list of keyword queries
//! covering broad, specific, and adjacent facets of the description. The
//! list drives the vector-search fan-out in stage 2.

use serde::Deserialize;
use serde_json::json;

use crate::common::error_chain;
use crate::domains::pipeline::context::{fatal, RunContext, StageResult};
use crate::kernel::events::EventLevel;
use crate::kernel::jobs::PipelineStage;

const STAGE: &str = "query_expansion";

const SYSTEM_PROMPT: &str = "You generate search keyword queries for finding social-media \
creators that fit a business. Respond with a JSON object of the form \
{\"queries\": [\"...\"]} and nothing else.";

pub fn expansion_prompt(description: &str) -> String {
    format!(
        "Business description:\n{description}\n\n\
         Produce 4 to 8 short keyword queries for a creator search engine. Cover:\n\
         - broad queries for the overall niche\n\
         - specific queries for the exact audience and locale\n\
         - adjacent queries for related niches likely to overlap\n\
         Order them from most to least central."
    )
}

#[derive(Debug, Deserialize)]
struct ExpansionReply {
    queries: Vec<String>,
}

/// Parse the model reply: the strict shape is `{"queries": [...]}`, with a
/// bare JSON array tolerated.
pub fn parse_keywords(raw: &str) -> Result<Vec<String>, String> {
    let cleaned = openai_client::strip_code_blocks(raw);

    let queries = match serde_json::from_str::<ExpansionReply>(cleaned) {
        Ok(reply) => reply.queries,
        Err(_) => serde_json::from_str::<Vec<String>>(cleaned)
            .map_err(|e| format!("unparseable keyword reply: {e}"))?,
    };

    let queries: Vec<String> = queries
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .collect();

    if queries.is_empty() {
        return Err("keyword reply contained no queries".into());
    }
    Ok(queries)
}

pub async fn run(ctx: &RunContext) -> StageResult<Vec<String>> {
    ctx.check_cancelled().await?;
    ctx.wf_start(STAGE);
    ctx.advance(PipelineStage::QueryExpansion, 0).await?;
    ctx.event(
        EventLevel::Info,
        "stage_started",
        json!({"stage": STAGE}),
    )
    .await?;

    let prompt = expansion_prompt(&ctx.params.business_description);
    let reply = ctx
        .kernel
        .scoring
        .complete_json(SYSTEM_PROMPT, &prompt)
        .await
        .map_err(|e| fatal(STAGE, error_chain(&e)))?;

    let keywords = parse_keywords(&reply).map_err(|e| fatal(STAGE, e))?;

    ctx.merge_meta(json!({
        "query_expansion_status": "completed",
        "query_count": keywords.len(),
        "query_expansion_prompt": prompt,
    }))
    .await?;
    ctx.advance(PipelineStage::QueryExpansion, 10).await?;
    ctx.event(
        EventLevel::Info,
        "queries_expanded",
        json!({"queries": keywords}),
    )
    .await?;
    ctx.wf_end(STAGE);

    Ok(keywords)
}
