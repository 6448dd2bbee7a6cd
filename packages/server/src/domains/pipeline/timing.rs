//! Relative-time waterfall for a pipeline run.
//!
//! Every stage and sub-stage records start/end offsets from the run's start,
//! published as the `timing` artifact for the run's Gantt view.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct WaterfallEntry {
    pub name: String,
    pub start_ms: i64,
    pub end_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Waterfall {
    started_at: DateTime<Utc>,
    entries: Vec<WaterfallEntry>,
}

impl Waterfall {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            entries: Vec::new(),
        }
    }

    pub fn start(&mut self, name: &str) {
        self.start_at(name, Utc::now());
    }

    pub fn start_at(&mut self, name: &str, at: DateTime<Utc>) {
        self.entries.push(WaterfallEntry {
            name: name.to_string(),
            start_ms: self.offset_ms(at),
            end_ms: None,
        });
    }

    /// Close the most recent open entry with this name. Unknown names no-op;
    /// timing must never fail a run.
    pub fn end(&mut self, name: &str) {
        self.end_at(name, Utc::now());
    }

    pub fn end_at(&mut self, name: &str, at: DateTime<Utc>) {
        let offset = self.offset_ms(at);
        if let Some(entry) = self
            .entries
            .iter_mut()
            .rev()
            .find(|e| e.name == name && e.end_ms.is_none())
        {
            entry.end_ms = Some(offset);
        }
    }

    fn offset_ms(&self, at: DateTime<Utc>) -> i64 {
        (at - self.started_at).num_milliseconds().max(0)
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "started_at": self.started_at,
            "entries": self.entries,
        })
    }
}

impl Default for Waterfall {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn entries_record_relative_offsets() {
        let t0 = Utc::now();
        let mut waterfall = Waterfall::starting_at(t0);
        waterfall.start_at("query_expansion", t0 + Duration::milliseconds(100));
        waterfall.end_at("query_expansion", t0 + Duration::milliseconds(450));

        let value = waterfall.to_value();
        assert_eq!(value["entries"][0]["name"], "query_expansion");
        assert_eq!(value["entries"][0]["start_ms"], 100);
        assert_eq!(value["entries"][0]["end_ms"], 450);
    }

    #[test]
    fn end_closes_latest_open_entry_with_name() {
        let t0 = Utc::now();
        let mut waterfall = Waterfall::starting_at(t0);
        waterfall.start_at("batch:0", t0);
        waterfall.start_at("batch:0", t0 + Duration::milliseconds(50));
        waterfall.end_at("batch:0", t0 + Duration::milliseconds(80));

        let value = waterfall.to_value();
        assert!(value["entries"][0]["end_ms"].is_null());
        assert_eq!(value["entries"][1]["end_ms"], 80);
    }

    #[test]
    fn ending_unknown_entry_is_a_noop() {
        let mut waterfall = Waterfall::new();
        waterfall.end("never-started");
        assert_eq!(waterfall.to_value()["entries"].as_array().unwrap().len(), 0);
    }
}
