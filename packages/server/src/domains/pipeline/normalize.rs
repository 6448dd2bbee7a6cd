//! Profile normalization.
//!
//! Enrichment payloads arrive in two provider shapes (Instagram and TikTok
//! datasets) plus whatever the cache stored; everything converges into one
//! `NormalizedProfile` keyed by platform. Posts are truncated to the most
//! recent eight and rendered with relative dates for the scoring prompt.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::{normalize_profile_url, Platform};

/// Newest-post window; older profiles short-circuit to fit 0.
pub const INACTIVE_AFTER_DAYS: i64 = 60;

/// Posts kept per profile for scoring.
pub const MAX_POSTS: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostEntry {
    pub caption: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub likes: Option<i64>,
    pub comments: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedProfile {
    pub platform: Platform,
    pub account_id: String,
    pub display_name: String,
    pub followers: Option<i64>,
    pub biography: String,
    pub profile_url: String,
    pub posts_data: Vec<PostEntry>,
}

/// Convert one raw provider payload. Entries without a profile URL are
/// unusable and dropped.
pub fn normalize_profile(raw: &Value, platform_hint: Platform) -> Option<NormalizedProfile> {
    let profile_url = first_string(raw, &["profile_url", "url", "account_url"])?;
    let normalized_url = normalize_profile_url(&profile_url);

    let platform = match Platform::from_url(&normalized_url) {
        Platform::Unknown => platform_hint,
        derived => derived,
    };

    let account_id = first_string(raw, &["account_id", "id", "account"])
        .unwrap_or_else(|| normalized_url.clone());
    let display_name = first_string(raw, &["display_name", "full_name", "nickname", "profile_name"])
        .unwrap_or_else(|| account_id.clone());
    let biography =
        first_string(raw, &["biography", "bio", "signature", "description"]).unwrap_or_default();
    let followers = first_i64(raw, &["followers", "followers_count", "follower_count"]);

    let mut posts: Vec<PostEntry> = raw
        .get("posts_data")
        .or_else(|| raw.get("posts"))
        .or_else(|| raw.get("videos"))
        .or_else(|| raw.get("top_posts"))
        .and_then(Value::as_array)
        .map(|entries| entries.iter().filter_map(normalize_post).collect())
        .unwrap_or_default();

    // Most recent first; undated posts sink to the back
    posts.sort_by_key(|p| std::cmp::Reverse(p.timestamp.unwrap_or(DateTime::<Utc>::MIN_UTC)));
    posts.truncate(MAX_POSTS);

    Some(NormalizedProfile {
        platform,
        account_id,
        display_name,
        followers,
        biography,
        profile_url: normalized_url,
        posts_data: posts,
    })
}

fn normalize_post(raw: &Value) -> Option<PostEntry> {
    let caption = first_string(raw, &["caption", "description", "title", "text"])
        .unwrap_or_default();
    let timestamp = first_timestamp(raw, &["timestamp", "datetime", "created_time", "create_time"]);
    if caption.is_empty() && timestamp.is_none() {
        return None;
    }

    Some(PostEntry {
        caption,
        timestamp,
        likes: first_i64(raw, &["likes", "likes_count", "digg_count"]),
        comments: first_i64(raw, &["comments", "comments_count", "comment_count"]),
    })
}

/// True when no post falls inside the activity window.
pub fn is_inactive(profile: &NormalizedProfile, now: DateTime<Utc>) -> bool {
    let cutoff = now - Duration::days(INACTIVE_AFTER_DAYS);
    !profile
        .posts_data
        .iter()
        .any(|post| post.timestamp.is_some_and(|ts| ts >= cutoff))
}

/// Coarse human-readable age for the scoring prompt ("3 days ago").
pub fn relative_age(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now - ts;
    if elapsed < Duration::zero() {
        return "just now".to_string();
    }
    if elapsed < Duration::hours(1) {
        return format!("{} minutes ago", elapsed.num_minutes().max(1));
    }
    if elapsed < Duration::days(1) {
        return format!("{} hours ago", elapsed.num_hours());
    }
    if elapsed < Duration::days(30) {
        return format!("{} days ago", elapsed.num_days());
    }
    if elapsed < Duration::days(365) {
        return format!("{} months ago", elapsed.num_days() / 30);
    }
    format!("{} years ago", elapsed.num_days() / 365)
}

fn first_string(raw: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        raw.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
    })
}

fn first_i64(raw: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|key| raw.get(key).and_then(Value::as_i64))
}

fn first_timestamp(raw: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter().find_map(|key| match raw.get(key)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|epoch| {
            // Seconds vs milliseconds by magnitude
            if epoch > 100_000_000_000 {
                Utc.timestamp_millis_opt(epoch).single()
            } else {
                Utc.timestamp_opt(epoch, 0).single()
            }
        }),
        _ => None,
    })
}
