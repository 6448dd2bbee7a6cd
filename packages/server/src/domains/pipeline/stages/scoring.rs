//! Batch scoring against the business description.
//!
//! Each profile gets one scoring-model call (strict JSON `{score, rationale,
//! summary}` on a 1–10 scale, mapped to fit 0–100), bounded by the global
//! scoring semaphore. Inactive profiles short-circuit to fit 0 without a
//! model call, and a profile whose calls keep failing degrades to fit 0 —
//! a single bad profile never fails its batch.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domains::pipeline::context::RunContext;
use crate::domains::pipeline::normalize::{
    is_inactive, relative_age, NormalizedProfile, INACTIVE_AFTER_DAYS,
};
use crate::kernel::providers::ScoringModel;

/// A perfect 10/10 maps to 100, the good-fit threshold.
pub const GOOD_FIT_THRESHOLD: i32 = 100;

/// Retries per profile after the first attempt, with 1s then 2s backoff.
const SCORE_RETRIES: u32 = 2;

pub const INACTIVE_RATIONALE: &str = "inactive - no posts in last 60 days";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredProfile {
    #[serde(flatten)]
    pub profile: NormalizedProfile,
    pub fit_score: i32,
    pub fit_rationale: String,
    pub fit_summary: String,
}

/// Map the model's 1–10 score to the 0–100 fit scale.
pub fn fit_from_score(score: f64) -> i32 {
    let clamped = score.clamp(1.0, 10.0);
    (clamped / 10.0 * 100.0).round() as i32
}

pub fn system_prompt(strict_location: bool) -> String {
    let location_rules = if strict_location {
        "Location match carries 70% of the total score. A profile with no \
         verifiable location scores at most 3. Penalize heavily when the \
         location is unknown or only implied; an unverified location caps \
         the achievable total at 5."
    } else {
        "Location match carries 60% of the total score when the business \
         description names a locale; otherwise weight content relevance and \
         audience fit evenly."
    };

    format!(
        "You rate how well a social-media creator fits a business looking \
         for promotion partners. {location_rules} Respond with a JSON object \
         {{\"score\": <integer 1-10>, \"rationale\": \"...\", \
         \"summary\": \"...\"}} and nothing else. The summary is one \
         sentence describing the creator."
    )
}

pub fn profile_prompt(
    profile: &NormalizedProfile,
    description: &str,
    now: DateTime<Utc>,
) -> String {
    let mut posts = String::new();
    for post in &profile.posts_data {
        let age = post
            .timestamp
            .map(|ts| relative_age(ts, now))
            .unwrap_or_else(|| "undated".to_string());
        posts.push_str(&format!("- ({age}) {}\n", post.caption));
    }
    if posts.is_empty() {
        posts.push_str("- none\n");
    }

    format!(
        "Business description:\n{description}\n\n\
         Creator profile:\n\
         platform: {platform}\n\
         name: {name}\n\
         followers: {followers}\n\
         bio: {bio}\n\
         recent posts:\n{posts}",
        platform = profile.platform,
        name = profile.display_name,
        followers = profile
            .followers
            .map(|f| f.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        bio = profile.biography,
    )
}

#[derive(Debug, Deserialize)]
struct ScoreReply {
    score: f64,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    summary: String,
}

fn parse_reply(raw: &str) -> Result<ScoreReply, String> {
    serde_json::from_str::<ScoreReply>(openai_client::strip_code_blocks(raw))
        .map_err(|e| format!("unparseable score reply: {e}"))
}

/// Score one profile. Degrades to fit 0 instead of erroring.
pub async fn score_profile(
    model: &dyn ScoringModel,
    profile: NormalizedProfile,
    description: &str,
    strict_location: bool,
    now: DateTime<Utc>,
) -> ScoredProfile {
    if is_inactive(&profile, now) {
        return ScoredProfile {
            fit_score: 0,
            fit_rationale: INACTIVE_RATIONALE.to_string(),
            fit_summary: format!(
                "{} has no posts within the last {INACTIVE_AFTER_DAYS} days.",
                profile.display_name
            ),
            profile,
        };
    }

    let system = system_prompt(strict_location);
    let user = profile_prompt(&profile, description, now);

    let mut last_error = String::new();
    for attempt in 0..=SCORE_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
        }

        let outcome = match model.complete_json(&system, &user).await {
            Ok(raw) => parse_reply(&raw),
            Err(e) => Err(format!("scoring call failed: {e:#}")),
        };

        match outcome {
            Ok(reply) => {
                return ScoredProfile {
                    fit_score: fit_from_score(reply.score),
                    fit_rationale: reply.rationale,
                    fit_summary: reply.summary,
                    profile,
                };
            }
            Err(e) => {
                tracing::warn!(
                    profile_url = %profile.profile_url,
                    attempt,
                    error = %e,
                    "profile scoring attempt failed"
                );
                last_error = e;
            }
        }
    }

    ScoredProfile {
        fit_score: 0,
        fit_rationale: format!("scoring unavailable after retries: {last_error}"),
        fit_summary: String::new(),
        profile,
    }
}

/// Score a batch concurrently under the global scoring bound, returning
/// profiles sorted by fit descending.
pub async fn score_batch(
    ctx: &RunContext,
    profiles: Vec<NormalizedProfile>,
) -> Vec<ScoredProfile> {
    let now = Utc::now();
    let description = ctx.params.business_description.clone();
    let strict = ctx.params.strict_location_matching;

    let tasks = profiles.into_iter().map(|profile| {
        let description = description.clone();
        let semaphore = ctx.kernel.scoring_semaphore.clone();
        let model = ctx.kernel.scoring.clone();
        async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            score_profile(model.as_ref(), profile, &description, strict, now).await
        }
    });

    let mut scored: Vec<ScoredProfile> = futures::future::join_all(tasks).await;
    scored.sort_by(|a, b| b.fit_score.cmp(&a.fit_score));
    scored
}
