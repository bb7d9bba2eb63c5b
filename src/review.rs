use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::model::{ClassificationResult, InstrumentType, TxAction};
use crate::patterns::{compute_hash, PatternStore, Source};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewResponse {
    Confirmed,
    Corrected,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewItem {
    pub id: Uuid,
    pub raw_text: String,
    pub brokerage: String,
    pub pattern_hash: String,
    pub our_interpretation: String,
    pub alternative: Option<String>,
    pub confidence: f64,
    pub question: String,
    pub parser_guess: ClassificationResult,
    pub llm_guess: Option<ClassificationResult>,
    /// The classification behind `our_interpretation`; written back verbatim
    /// on a confirm.
    pub best_guess: ClassificationResult,
    pub user_response: Option<ReviewResponse>,
    pub user_correction: Option<ClassificationResult>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub trader_id: Option<String>,
    pub import_id: Option<String>,
}

fn describe(c: &ClassificationResult) -> String {
    let action = match c.action {
        TxAction::Buy => "Buy",
        TxAction::Sell => "Sell",
        TxAction::Dividend => "Dividend",
        TxAction::Interest => "Interest",
        TxAction::Fee => "Fee",
        TxAction::Transfer => "Transfer",
        TxAction::Other => "Unrecognized activity",
    };
    let instrument = match c.instrument_type {
        InstrumentType::Equity => "equity",
        InstrumentType::Etf => "ETF",
        InstrumentType::Options => "option",
        InstrumentType::Bond => "bond",
        InstrumentType::Structured => "structured product",
        InstrumentType::Cash => "cash",
        InstrumentType::Unknown => "unknown instrument",
    };
    match (&c.strategy, &c.underlying) {
        (Some(strategy), Some(underlying)) => {
            format!("{} of {} ({} on {})", action, instrument, strategy, underlying)
        }
        (Some(strategy), None) => format!("{} of {} ({})", action, instrument, strategy),
        (None, Some(underlying)) => format!("{} of {} on {}", action, instrument, underlying),
        (None, None) => format!("{} of {}", action, instrument),
    }
}

fn question_for(c: &ClassificationResult) -> String {
    match c.strategy.as_deref() {
        Some("covered_call") | Some("likely_covered_call") => match &c.underlying {
            Some(u) => format!("Is this a covered call written against your {} shares?", u),
            None => "Is this a covered call written against shares you hold?".to_string(),
        },
        Some("cash_secured_put") => {
            "Is this a put sale secured by cash in the account?".to_string()
        }
        Some("naked_call") | Some("naked_put") => {
            "Did this open a new short option position (rather than close an existing one)?"
                .to_string()
        }
        _ => match c.action {
            TxAction::Dividend | TxAction::Interest => {
                "Is this an income payment (dividend or interest)?".to_string()
            }
            _ => format!("Is this correct: {}?", describe(c)),
        },
    }
}

/// Durable holding area for rows no tier could resolve. Resolution is the
/// only path that writes `user_confirmed` entries into pattern memory, so
/// that authority level always represents verified ground truth.
pub struct ReviewQueue {
    store: PatternStore,
    items: DashMap<Uuid, ReviewItem>,
    trader_id: Option<String>,
    import_id: Option<String>,
}

impl ReviewQueue {
    pub fn new(store: PatternStore) -> Self {
        Self {
            store,
            items: DashMap::new(),
            trader_id: None,
            import_id: None,
        }
    }

    /// Attribution columns for multi-tenant grouping of flagged rows.
    pub fn with_attribution(mut self, trader_id: Option<String>, import_id: Option<String>) -> Self {
        self.trader_id = trader_id;
        self.import_id = import_id;
        self
    }

    /// Flag an unresolved row. The interpretation follows the dominant guess
    /// (LLM if it is more confident than the parser); the alternative is only
    /// present when the two disagree.
    pub fn flag(
        &self,
        raw_text: &str,
        parser_guess: ClassificationResult,
        llm_guess: Option<ClassificationResult>,
        brokerage: &str,
    ) -> ReviewItem {
        let (best, other) = match &llm_guess {
            Some(llm) if llm.confidence > parser_guess.confidence => {
                (llm.clone(), Some(&parser_guess))
            }
            Some(_) => (parser_guess.clone(), llm_guess.as_ref()),
            None => (parser_guess.clone(), None),
        };

        let disagree = other.map_or(false, |o| {
            o.instrument_type != best.instrument_type
                || o.action != best.action
                || o.strategy != best.strategy
        });

        let item = ReviewItem {
            id: Uuid::new_v4(),
            raw_text: raw_text.to_string(),
            brokerage: brokerage.to_string(),
            pattern_hash: compute_hash(raw_text, brokerage),
            our_interpretation: describe(&best),
            alternative: if disagree {
                other.map(describe)
            } else {
                None
            },
            confidence: best.confidence,
            question: question_for(&best),
            parser_guess,
            llm_guess,
            best_guess: best,
            user_response: None,
            user_correction: None,
            resolved_at: None,
            trader_id: self.trader_id.clone(),
            import_id: self.import_id.clone(),
        };

        self.items.insert(item.id, item.clone());
        item
    }

    pub fn pending(&self) -> Vec<ReviewItem> {
        self.items
            .iter()
            .filter(|e| e.resolved_at.is_none())
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn get(&self, id: Uuid) -> Option<ReviewItem> {
        self.items.get(&id).map(|e| e.clone())
    }

    /// Resolve a flagged row. Confirm writes the original interpretation into
    /// pattern memory at `user_confirmed` / 1.0; correct writes the supplied
    /// correction instead; skip writes nothing.
    pub async fn resolve(
        &self,
        item_id: Uuid,
        response: ReviewResponse,
        correction: Option<ClassificationResult>,
    ) -> anyhow::Result<ReviewItem> {
        let mut item = self
            .items
            .get(&item_id)
            .map(|e| e.clone())
            .ok_or_else(|| anyhow::anyhow!("unknown review item {}", item_id))?;

        item.user_response = Some(response);
        item.resolved_at = Some(Utc::now());

        let learned = match response {
            ReviewResponse::Confirmed => Some(item.best_guess.clone()),
            ReviewResponse::Corrected => {
                let correction = correction
                    .ok_or_else(|| anyhow::anyhow!("corrected response requires a correction"))?;
                item.user_correction = Some(correction.clone());
                Some(correction)
            }
            ReviewResponse::Skipped => None,
        };

        if let Some(mut classification) = learned {
            classification.confidence = 1.0;
            self.store
                .store(
                    &item.pattern_hash,
                    &item.raw_text,
                    &item.brokerage,
                    classification,
                    1.0,
                    Source::UserConfirmed,
                )
                .await;
            info!("✅ Review resolved and learned: {}", item.our_interpretation);
        }

        self.items.insert(item_id, item.clone());
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guess(confidence: f64, strategy: Option<&str>) -> ClassificationResult {
        ClassificationResult {
            instrument_type: InstrumentType::Options,
            action: TxAction::Sell,
            strategy: strategy.map(String::from),
            is_closing: None,
            underlying: Some("AAPL".to_string()),
            confidence,
            complexity_score: None,
        }
    }

    #[test]
    fn test_alternative_only_on_disagreement() {
        let queue = ReviewQueue::new(PatternStore::in_memory());
        let item = queue.flag(
            "SOLD 5 AAPL CALL",
            guess(0.6, Some("covered_call")),
            Some(guess(0.8, Some("naked_call"))),
            "schwab",
        );
        assert!(item.alternative.is_some());

        let item = queue.flag(
            "SOLD 5 AAPL CALL",
            guess(0.6, Some("covered_call")),
            Some(guess(0.8, Some("covered_call"))),
            "schwab",
        );
        assert!(item.alternative.is_none());
    }

    #[test]
    fn test_question_targets_dominant_guess() {
        let queue = ReviewQueue::new(PatternStore::in_memory());
        let item = queue.flag(
            "SOLD 5 AAPL CALL",
            guess(0.6, None),
            Some(guess(0.8, Some("covered_call"))),
            "schwab",
        );
        assert!(item.question.contains("covered call"));
        assert!(item.question.contains("AAPL"));
    }

    #[tokio::test]
    async fn test_confirm_writes_user_confirmed_at_full_confidence() {
        let store = PatternStore::in_memory();
        let queue = ReviewQueue::new(store.clone());
        let item = queue.flag("SOLD 5 AAPL CALL", guess(0.6, Some("covered_call")), None, "schwab");

        queue
            .resolve(item.id, ReviewResponse::Confirmed, None)
            .await
            .unwrap();

        let entry = store.lookup(&item.pattern_hash, "schwab", 0.99).await.unwrap();
        assert_eq!(entry.source, Source::UserConfirmed);
        assert_eq!(entry.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_correction_is_what_gets_learned() {
        let store = PatternStore::in_memory();
        let queue = ReviewQueue::new(store.clone());
        let item = queue.flag("SOLD 5 AAPL CALL", guess(0.6, Some("naked_call")), None, "schwab");

        queue
            .resolve(
                item.id,
                ReviewResponse::Corrected,
                Some(guess(0.6, Some("covered_call"))),
            )
            .await
            .unwrap();

        let entry = store.lookup(&item.pattern_hash, "schwab", 0.99).await.unwrap();
        assert_eq!(entry.classification.strategy.as_deref(), Some("covered_call"));
    }

    #[tokio::test]
    async fn test_skip_writes_nothing() {
        let store = PatternStore::in_memory();
        let queue = ReviewQueue::new(store.clone());
        let item = queue.flag("SOLD 5 AAPL CALL", guess(0.6, None), None, "schwab");

        queue
            .resolve(item.id, ReviewResponse::Skipped, None)
            .await
            .unwrap();

        assert!(store.lookup(&item.pattern_hash, "schwab", 0.0).await.is_none());
        assert!(queue.pending().is_empty());
    }
}
