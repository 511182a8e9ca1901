//! Network-request cache: the read-only query surface the tools run over.
//!
//! Capturing traffic is the collaborator's job; this module only defines the
//! entry record and the in-memory store behind the five query operations the
//! orchestrator depends on. The capture pipeline (or a test) feeds entries
//! in with [`NetworkCache::insert`]; the tools never mutate anything.
//!
//! Ordering: each target's entries keep insertion order (newest last), which
//! is stable within a single call, the only ordering the tools require.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// One captured network exchange.
///
/// Field names serialize in camelCase because tool results expose these
/// records to the model verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEntry {
    pub id: String,
    pub request: RequestRecord,
    pub response: ResponseRecord,
    pub timing: Timing,
    pub metadata: EntryMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    pub status: u16,
    pub status_text: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    pub start_time: u64,
    pub end_time: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    /// Coarse classification: "xhr", "fetch", "document", "script", ...
    pub request_type: String,
    pub has_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookies: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_headers: Option<Vec<String>>,
}

/// Status/method filter for [`NetworkCache::filter`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryFilter {
    pub method: Option<String>,
    pub min_status: Option<u16>,
    pub max_status: Option<u16>,
}

impl EntryFilter {
    /// Method matches case-insensitively; the status range is inclusive.
    pub fn matches(&self, entry: &NetworkEntry) -> bool {
        if let Some(method) = &self.method {
            if !entry.request.method.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        if let Some(min) = self.min_status {
            if entry.response.status < min {
                return false;
            }
        }
        if let Some(max) = self.max_status {
            if entry.response.status > max {
                return false;
            }
        }
        true
    }
}

/// Aggregate counts over one target's entries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatistics {
    pub total_entries: usize,
    pub by_method: BTreeMap<String, usize>,
    pub by_status: BTreeMap<u16, usize>,
    pub by_type: BTreeMap<String, usize>,
    pub error_count: usize,
}

/// In-memory store keyed by target id.
///
/// All access goes through a short-held mutex; queries clone out so no lock
/// is held while callers work with the results.
#[derive(Debug, Default)]
pub struct NetworkCache {
    entries: Mutex<HashMap<String, Vec<NetworkEntry>>>,
}

impl NetworkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a captured exchange for a target. Called by the capture
    /// collaborator, never by tools.
    pub fn insert(&self, target_id: impl Into<String>, entry: NetworkEntry) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.entry(target_id.into()).or_default().push(entry);
    }

    /// Drop every entry for a target (tab closed).
    pub fn clear_target(&self, target_id: &str) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.remove(target_id);
    }

    /// All entries for a target, insertion order, newest last.
    pub fn entries_for_target(&self, target_id: &str) -> Vec<NetworkEntry> {
        let entries = self.entries.lock().expect("cache lock poisoned");
        entries.get(target_id).cloned().unwrap_or_default()
    }

    /// Look up one entry by id.
    pub fn entry(&self, target_id: &str, id: &str) -> Option<NetworkEntry> {
        let entries = self.entries.lock().expect("cache lock poisoned");
        entries
            .get(target_id)?
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    /// Case-insensitive substring match on the request URL.
    pub fn search_by_url(&self, target_id: &str, substring: &str) -> Vec<NetworkEntry> {
        let needle = substring.to_lowercase();
        let entries = self.entries.lock().expect("cache lock poisoned");
        entries
            .get(target_id)
            .map(|list| {
                list.iter()
                    .filter(|e| e.request.url.to_lowercase().contains(&needle))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Filter by method (case-insensitive exact) and status range.
    pub fn filter(&self, target_id: &str, filter: &EntryFilter) -> Vec<NetworkEntry> {
        let entries = self.entries.lock().expect("cache lock poisoned");
        entries
            .get(target_id)
            .map(|list| list.iter().filter(|e| filter.matches(e)).cloned().collect())
            .unwrap_or_default()
    }

    /// Aggregate counts for a target.
    pub fn statistics(&self, target_id: &str) -> CacheStatistics {
        let entries = self.entries.lock().expect("cache lock poisoned");
        let list = entries.get(target_id).map(Vec::as_slice).unwrap_or(&[]);

        let mut by_method: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_status: BTreeMap<u16, usize> = BTreeMap::new();
        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
        let mut error_count = 0;

        for entry in list {
            *by_method
                .entry(entry.request.method.to_uppercase())
                .or_default() += 1;
            *by_status.entry(entry.response.status).or_default() += 1;
            *by_type
                .entry(entry.metadata.request_type.clone())
                .or_default() += 1;
            if entry.metadata.has_error {
                error_count += 1;
            }
        }

        CacheStatistics {
            total_entries: list.len(),
            by_method,
            by_status,
            by_type,
            error_count,
        }
    }
}
