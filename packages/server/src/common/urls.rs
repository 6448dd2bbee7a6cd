//! Profile URL normalization and platform tagging.
//!
//! One normalized form is shared by candidate deduplication, profile-cache
//! keys, and exclusion-list matching, so the same creator can never slip
//! through under a cosmetic URL variant.

use serde::{Deserialize, Serialize};

/// Social platform of a profile URL. Closed tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Instagram,
    Tiktok,
    #[default]
    Unknown,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Instagram => "instagram",
            Platform::Tiktok => "tiktok",
            Platform::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "instagram" => Some(Platform::Instagram),
            "tiktok" => Some(Platform::Tiktok),
            _ => None,
        }
    }

    /// Derive the platform from a (normalized or raw) profile URL.
    pub fn from_url(url: &str) -> Self {
        let lowered = url.to_ascii_lowercase();
        if lowered.contains("instagram.com") {
            Platform::Instagram
        } else if lowered.contains("tiktok.com") {
            Platform::Tiktok
        } else {
            Platform::Unknown
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hosts whose `www.` prefix is stripped during normalization.
const SUPPORTED_HOSTS: [&str; 2] = ["instagram.com", "tiktok.com"];

/// Normalize a profile URL: lowercase, drop the trailing slash, and strip
/// `www.` for supported hosts. Unparseable input falls back to plain string
/// cleanup so exclusion matching still works on malformed entries.
pub fn normalize_profile_url(raw: &str) -> String {
    let trimmed = raw.trim().to_ascii_lowercase();
    let without_slash = trimmed.trim_end_matches('/');

    match url::Url::parse(without_slash) {
        Ok(parsed) => {
            let Some(host) = parsed.host_str() else {
                return without_slash.to_string();
            };
            let bare = host.strip_prefix("www.").unwrap_or(host);
            if host != bare && SUPPORTED_HOSTS.iter().any(|h| bare.ends_with(h)) {
                without_slash.replacen(host, bare, 1)
            } else {
                without_slash.to_string()
            }
        }
        Err(_) => without_slash.to_string(),
    }
}
