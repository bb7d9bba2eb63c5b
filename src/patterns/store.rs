use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::model::ClassificationResult;
use crate::patterns::normalizer::PatternHash;

/// Who produced a cached classification. Ordering is the authority ranking:
/// a higher source may overwrite a lower one, never the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Parser,
    Llm,
    UserConfirmed,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Parser => "parser",
            Source::Llm => "llm",
            Source::UserConfirmed => "user_confirmed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternMemoryEntry {
    pub pattern_hash: PatternHash,
    pub raw_text_sample: String,
    pub brokerage: String,
    pub classification: ClassificationResult,
    pub confidence: f64,
    pub source: Source,
    pub times_matched: u64,
    pub created_at: DateTime<Utc>,
    pub last_matched_at: DateTime<Utc>,
}

/// The opaque persistent backend (§6). Real deployments put a relational or
/// key-value store behind this; tests and the demo binary use the in-memory
/// implementation below.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    async fn get(&self, hash: &str, brokerage: &str) -> Result<Option<PatternMemoryEntry>>;
    async fn put(&self, entry: PatternMemoryEntry) -> Result<()>;
    async fn scan(&self) -> Result<Vec<PatternMemoryEntry>>;
}

#[derive(Default)]
pub struct InMemoryBackend {
    entries: DashMap<(String, String), PatternMemoryEntry>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    async fn get(&self, hash: &str, brokerage: &str) -> Result<Option<PatternMemoryEntry>> {
        Ok(self
            .entries
            .get(&(hash.to_string(), brokerage.to_string()))
            .map(|e| e.clone()))
    }

    async fn put(&self, entry: PatternMemoryEntry) -> Result<()> {
        self.entries.insert(
            (entry.pattern_hash.clone(), entry.brokerage.clone()),
            entry,
        );
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<PatternMemoryEntry>> {
        Ok(self.entries.iter().map(|e| e.value().clone()).collect())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub total_patterns: usize,
    pub by_brokerage: HashMap<String, usize>,
    pub by_source: HashMap<String, usize>,
    pub avg_times_matched: f64,
}

/// Content-addressed cache of learned classifications, keyed by
/// `(pattern_hash, brokerage)`. All failure modes of the backing store
/// degrade: lookup -> miss, store -> no-op. The pipeline must keep running
/// even if memory is gone.
#[derive(Clone)]
pub struct PatternStore {
    backend: Arc<dyn MemoryBackend>,
}

impl PatternStore {
    pub fn new(backend: Arc<dyn MemoryBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBackend::new()))
    }

    /// Cache lookup. Returns nothing when the stored confidence is below
    /// `min_confidence`. On a hit, bumps the usage counters.
    pub async fn lookup(
        &self,
        hash: &str,
        brokerage: &str,
        min_confidence: f64,
    ) -> Option<PatternMemoryEntry> {
        let existing = match self.backend.get(hash, brokerage).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("⚠️ Pattern store unreachable, treating as miss: {}", e);
                return None;
            }
        };

        let mut entry = existing?;
        if entry.confidence < min_confidence {
            debug!(
                "Pattern {} known but confidence {:.2} < {:.2}, ignoring",
                &hash[..8.min(hash.len())],
                entry.confidence,
                min_confidence
            );
            return None;
        }

        entry.times_matched += 1;
        entry.last_matched_at = Utc::now();
        if let Err(e) = self.backend.put(entry.clone()).await {
            // Counter bump is best-effort; the hit itself still counts.
            warn!("⚠️ Failed to bump pattern usage counter: {}", e);
        }
        Some(entry)
    }

    /// Authority-ranked upsert. A write lands only if the new source outranks
    /// the existing one, or ranks equal with strictly higher confidence — the
    /// store never regresses to a worse answer. Returns whether a write
    /// happened (false covers both the no-op case and a dead backend).
    pub async fn store(
        &self,
        hash: &str,
        raw_text: &str,
        brokerage: &str,
        classification: ClassificationResult,
        confidence: f64,
        source: Source,
    ) -> bool {
        let existing = match self.backend.get(hash, brokerage).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("⚠️ Pattern store unreachable, dropping write: {}", e);
                return false;
            }
        };

        let (created_at, times_matched) = match &existing {
            Some(prev) => {
                let keep_existing = source < prev.source
                    || (source == prev.source && confidence <= prev.confidence);
                if keep_existing {
                    debug!(
                        "Keeping {} entry at {:.2} over {} at {:.2} for pattern {}",
                        prev.source.as_str(),
                        prev.confidence,
                        source.as_str(),
                        confidence,
                        &hash[..8.min(hash.len())]
                    );
                    return false;
                }
                (prev.created_at, prev.times_matched)
            }
            None => (Utc::now(), 0),
        };

        let entry = PatternMemoryEntry {
            pattern_hash: hash.to_string(),
            raw_text_sample: raw_text.to_string(),
            brokerage: brokerage.to_string(),
            classification,
            confidence,
            source,
            times_matched,
            created_at,
            last_matched_at: Utc::now(),
        };

        match self.backend.put(entry).await {
            Ok(()) => true,
            Err(e) => {
                warn!("⚠️ Pattern store unreachable, dropping write: {}", e);
                false
            }
        }
    }

    pub async fn stats(&self) -> MemoryStats {
        let entries = match self.backend.scan().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("⚠️ Pattern store unreachable, empty stats: {}", e);
                Vec::new()
            }
        };

        let mut by_brokerage: HashMap<String, usize> = HashMap::new();
        let mut by_source: HashMap<String, usize> = HashMap::new();
        let mut total_matches = 0u64;
        for entry in &entries {
            *by_brokerage.entry(entry.brokerage.clone()).or_default() += 1;
            *by_source
                .entry(entry.source.as_str().to_string())
                .or_default() += 1;
            total_matches += entry.times_matched;
        }

        let avg_times_matched = if entries.is_empty() {
            0.0
        } else {
            total_matches as f64 / entries.len() as f64
        };

        MemoryStats {
            total_patterns: entries.len(),
            by_brokerage,
            by_source,
            avg_times_matched,
        }
    }
}
