use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::llm::{BatchClassifier, EscalationRow, LlmClassification, LlmError};
use crate::model::{
    AccountPositionContext, ClassificationResult, ClassifiedBy, ClassifiedTransaction,
    InstrumentType, Transaction,
};
use crate::patterns::{compute_hash, PatternStore, Source};
use crate::review::{ReviewItem, ReviewQueue};
use crate::scoring;
use crate::strategies::StrategyDetector;

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    pub total: usize,
    pub layer1_resolved: usize,
    pub layer2_resolved: usize,
    pub layer3_flagged: usize,
    pub memory_hits: usize,
    pub new_patterns_learned: usize,
}

pub struct BatchOutcome {
    /// One entry per input row, same order. Flagged rows carry the best
    /// available guess with `ClassifiedBy::ReviewPending`.
    pub transactions: Vec<ClassifiedTransaction>,
    pub stats: BatchStats,
    pub review_needed: Vec<ReviewItem>,
}

struct PendingRow {
    index: usize,
    hash: String,
    tx: Transaction,
    parser_guess: ClassificationResult,
    llm_guess: Option<ClassificationResult>,
}

/// The tiered classification pipeline: pattern memory, then deterministic
/// parsing and scoring, then LLM escalation, then human review. Every row
/// leaves with an answer; failures downstream only push rows to a later tier.
pub struct Orchestrator {
    config: PipelineConfig,
    store: PatternStore,
    detector: StrategyDetector,
    classifier: Option<Arc<dyn BatchClassifier>>,
    review: ReviewQueue,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        store: PatternStore,
        detector: StrategyDetector,
        classifier: Option<Arc<dyn BatchClassifier>>,
    ) -> Self {
        let review = ReviewQueue::new(store.clone());
        Self {
            config,
            store,
            detector,
            classifier,
            review,
        }
    }

    pub fn review_queue(&self) -> &ReviewQueue {
        &self.review
    }

    pub fn store(&self) -> &PatternStore {
        &self.store
    }

    /// Classify a batch of rows. Infallible by contract: every input row is
    /// present in the output exactly once, classified or flagged.
    pub async fn classify_batch(
        &self,
        rows: Vec<Transaction>,
        positions: &AccountPositionContext,
        brokerage: &str,
        trade_history: &[String],
    ) -> BatchOutcome {
        let mut stats = BatchStats {
            total: rows.len(),
            ..Default::default()
        };
        let mut resolved: Vec<Option<ClassifiedTransaction>> = rows.iter().map(|_| None).collect();
        let mut pending: Vec<PendingRow> = Vec::new();

        // Tier 1: memory lookup + deterministic parse and score.
        for (index, tx) in rows.into_iter().enumerate() {
            let hash = compute_hash(&tx.raw_text, brokerage);

            let memory_entry = self
                .store
                .lookup(&hash, brokerage, self.config.memory_lookup_threshold)
                .await;

            let mut parser_guess =
                self.parser_classification(&tx, positions, brokerage, trade_history);

            let (mut classification, classified_by) = match memory_entry {
                Some(entry) => {
                    stats.memory_hits += 1;
                    let scored =
                        scoring::score(&tx, &tx.raw_text, Some(positions), Some(entry.confidence));
                    let mut classification = entry.classification;
                    classification.confidence = scored;
                    (classification, ClassifiedBy::Memory)
                }
                None => {
                    let scored = scoring::score(&tx, &tx.raw_text, Some(positions), None);
                    // A high-certainty strategy verdict (e.g. a brokerage
                    // policy rewrite) outranks the generic option base case.
                    parser_guess.confidence = scored.max(parser_guess.confidence).min(1.0);
                    (parser_guess.clone(), ClassifiedBy::Parser)
                }
            };
            classification.confidence = classification.confidence.clamp(0.0, 1.0);

            if classification.confidence >= self.config.accept_threshold {
                if classified_by == ClassifiedBy::Parser {
                    let written = self
                        .store
                        .store(
                            &hash,
                            &tx.raw_text,
                            brokerage,
                            classification.clone(),
                            classification.confidence,
                            Source::Parser,
                        )
                        .await;
                    if written {
                        stats.new_patterns_learned += 1;
                    }
                }
                stats.layer1_resolved += 1;
                resolved[index] = Some(ClassifiedTransaction {
                    transaction: tx,
                    classification,
                    classified_by,
                    pattern_hash: hash,
                });
            } else {
                debug!(
                    "Row {} below accept threshold ({:.2} < {:.2}), escalating",
                    index, classification.confidence, self.config.accept_threshold
                );
                pending.push(PendingRow {
                    index,
                    hash,
                    tx,
                    parser_guess,
                    llm_guess: None,
                });
            }
        }

        // Tier 2: LLM escalation, sub-batched with bounded concurrency. A
        // failed sub-batch degrades those rows to their parser guesses.
        if let Some(classifier) = &self.classifier {
            if !pending.is_empty() {
                let (accepted, rest) = self
                    .escalate(classifier.clone(), pending, positions, brokerage)
                    .await;
                for (row, classification) in accepted {
                    let written = self
                        .store
                        .store(
                            &row.hash,
                            &row.tx.raw_text,
                            brokerage,
                            classification.clone(),
                            classification.confidence,
                            Source::Llm,
                        )
                        .await;
                    if written {
                        stats.new_patterns_learned += 1;
                    }
                    stats.layer2_resolved += 1;
                    resolved[row.index] = Some(ClassifiedTransaction {
                        transaction: row.tx,
                        classification,
                        classified_by: ClassifiedBy::Llm,
                        pattern_hash: row.hash,
                    });
                }
                pending = rest;
            }
        }

        // Tier 3: whatever is left goes to a human.
        let mut review_needed = Vec::with_capacity(pending.len());
        for row in pending {
            let item = self.review.flag(
                &row.tx.raw_text,
                row.parser_guess.clone(),
                row.llm_guess.clone(),
                brokerage,
            );
            stats.layer3_flagged += 1;

            let best = row.llm_guess.unwrap_or(row.parser_guess);
            resolved[row.index] = Some(ClassifiedTransaction {
                transaction: row.tx,
                classification: best,
                classified_by: ClassifiedBy::ReviewPending,
                pattern_hash: row.hash,
            });
            review_needed.push(item);
        }

        info!(
            "📊 Batch done: {} rows, {} layer1, {} layer2, {} flagged ({} memory hits, {} learned)",
            stats.total,
            stats.layer1_resolved,
            stats.layer2_resolved,
            stats.layer3_flagged,
            stats.memory_hits,
            stats.new_patterns_learned
        );

        BatchOutcome {
            transactions: resolved.into_iter().flatten().collect(),
            stats,
            review_needed,
        }
    }

    /// Parser-tier classification: the upstream parser's fields plus the
    /// strategy detector for option rows.
    fn parser_classification(
        &self,
        tx: &Transaction,
        positions: &AccountPositionContext,
        brokerage: &str,
        trade_history: &[String],
    ) -> ClassificationResult {
        let mut result = ClassificationResult::from_transaction(tx);

        if tx.instrument_type == InstrumentType::Options {
            if let Some(details) = &tx.option_details {
                let strategy = self.detector.classify(
                    tx,
                    Some(positions),
                    details,
                    trade_history,
                    Some(brokerage),
                );
                result.strategy = Some(strategy.strategy_key);
                result.complexity_score = Some(strategy.complexity_score);
                result.confidence = strategy.confidence;
            }
        }
        result
    }

    async fn escalate(
        &self,
        classifier: Arc<dyn BatchClassifier>,
        pending: Vec<PendingRow>,
        positions: &AccountPositionContext,
        brokerage: &str,
    ) -> (Vec<(PendingRow, ClassificationResult)>, Vec<PendingRow>) {
        let batch_size = self.config.llm_batch_size.max(1);
        let mut chunks: Vec<Vec<PendingRow>> = Vec::new();
        let mut current = Vec::with_capacity(batch_size);
        for row in pending {
            current.push(row);
            if current.len() == batch_size {
                chunks.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }

        info!(
            "🤖 Escalating {} ambiguous rows in {} sub-batches",
            chunks.iter().map(Vec::len).sum::<usize>(),
            chunks.len()
        );

        let results: Vec<(Vec<PendingRow>, Result<Vec<LlmClassification>, LlmError>)> =
            stream::iter(chunks)
                .map(|chunk| {
                    let classifier = classifier.clone();
                    async move {
                        let request: Vec<EscalationRow> = chunk
                            .iter()
                            .enumerate()
                            .map(|(i, row)| EscalationRow {
                                index: i,
                                raw_text: row.tx.raw_text.clone(),
                                parser_guess: row.parser_guess.clone(),
                            })
                            .collect();
                        let result = classifier
                            .classify_batch(&request, positions, brokerage)
                            .await;
                        (chunk, result)
                    }
                })
                .buffer_unordered(self.config.llm_concurrency.max(1))
                .collect()
                .await;

        let mut accepted = Vec::new();
        let mut still_pending = Vec::new();
        for (chunk, result) in results {
            match result {
                Ok(classifications) if classifications.len() != chunk.len() => {
                    // A misbehaving classifier must not swallow rows.
                    warn!(
                        "⚠️ LLM returned {} answers for {} rows, keeping parser guesses",
                        classifications.len(),
                        chunk.len()
                    );
                    still_pending.extend(chunk);
                }
                Ok(classifications) => {
                    for (mut row, llm) in chunk.into_iter().zip(classifications) {
                        let classification = ClassificationResult {
                            instrument_type: llm.instrument_type,
                            action: llm.action,
                            strategy: llm.strategy,
                            is_closing: None,
                            underlying: row.parser_guess.underlying.clone(),
                            confidence: llm.confidence.clamp(0.0, 1.0),
                            complexity_score: row.parser_guess.complexity_score,
                        };

                        if classification.confidence >= self.config.llm_accept_threshold {
                            accepted.push((row, classification));
                        } else {
                            row.llm_guess = Some(classification);
                            still_pending.push(row);
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "⚠️ LLM sub-batch of {} rows failed, keeping parser guesses: {}",
                        chunk.len(),
                        e
                    );
                    still_pending.extend(chunk);
                }
            }
        }
        (accepted, still_pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OptionDetails, OptionType, TxAction};
    use crate::strategies::RuleSet;
    use async_trait::async_trait;
    use rust_decimal::Decimal;

    fn equity_buy(raw: &str, symbol: &str) -> Transaction {
        Transaction {
            raw_text: raw.to_string(),
            action: TxAction::Buy,
            symbol: symbol.to_string(),
            quantity: Decimal::from(100),
            price: Decimal::from(50),
            amount: Decimal::from(5000),
            description: String::new(),
            instrument_type: InstrumentType::Equity,
            option_details: None,
            parser_confidence: Some(0.9),
        }
    }

    fn ambiguous_row(raw: &str) -> Transaction {
        Transaction {
            raw_text: raw.to_string(),
            action: TxAction::Other,
            symbol: String::new(),
            quantity: Decimal::ZERO,
            price: Decimal::ZERO,
            amount: Decimal::ZERO,
            description: "SPINOFF DISTRIBUTION".to_string(),
            instrument_type: InstrumentType::Unknown,
            option_details: None,
            parser_confidence: None,
        }
    }

    fn option_sell(raw: &str, underlying: &str) -> Transaction {
        Transaction {
            raw_text: raw.to_string(),
            action: TxAction::Sell,
            symbol: underlying.to_string(),
            quantity: Decimal::from(2),
            price: Decimal::new(350, 2),
            amount: Decimal::from(700),
            description: String::new(),
            instrument_type: InstrumentType::Options,
            option_details: Some(OptionDetails {
                underlying: underlying.to_string(),
                option_type: Some(OptionType::Call),
                strike: Some(Decimal::from(150)),
                expiry: Some("2026-12-18".to_string()),
            }),
            parser_confidence: Some(0.6),
        }
    }

    fn orchestrator(classifier: Option<Arc<dyn BatchClassifier>>) -> Orchestrator {
        Orchestrator::new(
            PipelineConfig::default(),
            PatternStore::in_memory(),
            StrategyDetector::new(RuleSet::fallback()),
            classifier,
        )
    }

    struct CannedClassifier {
        confidence: f64,
    }

    #[async_trait]
    impl BatchClassifier for CannedClassifier {
        async fn classify_batch(
            &self,
            rows: &[EscalationRow],
            _positions: &AccountPositionContext,
            _brokerage: &str,
        ) -> Result<Vec<LlmClassification>, LlmError> {
            Ok(rows
                .iter()
                .map(|_| LlmClassification {
                    instrument_type: InstrumentType::Equity,
                    action: TxAction::Transfer,
                    strategy: None,
                    confidence: self.confidence,
                    reasoning: Some("stock distribution from a spinoff".to_string()),
                })
                .collect())
        }
    }

    struct ShortResponseClassifier;

    #[async_trait]
    impl BatchClassifier for ShortResponseClassifier {
        async fn classify_batch(
            &self,
            _rows: &[EscalationRow],
            _positions: &AccountPositionContext,
            _brokerage: &str,
        ) -> Result<Vec<LlmClassification>, LlmError> {
            Ok(Vec::new())
        }
    }

    struct OutageClassifier;

    #[async_trait]
    impl BatchClassifier for OutageClassifier {
        async fn classify_batch(
            &self,
            _rows: &[EscalationRow],
            _positions: &AccountPositionContext,
            _brokerage: &str,
        ) -> Result<Vec<LlmClassification>, LlmError> {
            Err(LlmError::Timeout)
        }
    }

    #[tokio::test]
    async fn test_clean_equity_row_resolves_in_layer1() {
        let orch = orchestrator(None);
        let outcome = orch
            .classify_batch(
                vec![equity_buy("BOUGHT 100 AAPL @ 50.00", "AAPL")],
                &AccountPositionContext::default(),
                "schwab",
                &[],
            )
            .await;

        assert_eq!(outcome.stats.layer1_resolved, 1);
        assert_eq!(outcome.stats.new_patterns_learned, 1);
        assert_eq!(outcome.transactions[0].classified_by, ClassifiedBy::Parser);
        assert!(outcome.transactions[0].classification.confidence >= 0.95);
    }

    #[tokio::test]
    async fn test_second_pass_is_a_memory_hit() {
        let orch = orchestrator(None);
        let positions = AccountPositionContext::default();

        orch.classify_batch(
            vec![equity_buy("BOUGHT 100 AAPL @ 50.00", "AAPL")],
            &positions,
            "schwab",
            &[],
        )
        .await;

        // Same structure, different ticker and numbers.
        let outcome = orch
            .classify_batch(
                vec![equity_buy("BOUGHT 200 MSFT @ 41.00", "MSFT")],
                &positions,
                "schwab",
                &[],
            )
            .await;

        assert_eq!(outcome.stats.memory_hits, 1);
        assert_eq!(outcome.transactions[0].classified_by, ClassifiedBy::Memory);
        assert_eq!(outcome.stats.new_patterns_learned, 0);
    }

    #[tokio::test]
    async fn test_every_row_comes_back_exactly_once() {
        let orch = orchestrator(None);
        let rows = vec![
            equity_buy("BOUGHT 100 AAPL @ 50.00", "AAPL"),
            ambiguous_row("SPINOFF XYZ CORP"),
            option_sell("SOLD 2 TSLA DEC 18 2026 150 CALL", "TSLA"),
        ];
        let total = rows.len();
        let outcome = orch
            .classify_batch(rows, &AccountPositionContext::default(), "schwab", &[])
            .await;

        assert_eq!(outcome.transactions.len(), total);
        assert_eq!(
            outcome.stats.layer1_resolved + outcome.stats.layer2_resolved + outcome.stats.layer3_flagged,
            total
        );
    }

    #[tokio::test]
    async fn test_llm_resolves_ambiguous_rows() {
        let orch = orchestrator(Some(Arc::new(CannedClassifier { confidence: 0.90 })));
        let outcome = orch
            .classify_batch(
                vec![ambiguous_row("SPINOFF XYZ CORP")],
                &AccountPositionContext::default(),
                "schwab",
                &[],
            )
            .await;

        assert_eq!(outcome.stats.layer2_resolved, 1);
        assert_eq!(outcome.stats.layer3_flagged, 0);
        assert_eq!(outcome.transactions[0].classified_by, ClassifiedBy::Llm);
        assert!(outcome.review_needed.is_empty());
        // An accepted LLM answer is a learned pattern like any other.
        assert_eq!(outcome.stats.new_patterns_learned, 1);
    }

    #[tokio::test]
    async fn test_short_llm_response_keeps_every_row() {
        let orch = orchestrator(Some(Arc::new(ShortResponseClassifier)));
        let outcome = orch
            .classify_batch(
                vec![ambiguous_row("SPINOFF XYZ CORP")],
                &AccountPositionContext::default(),
                "schwab",
                &[],
            )
            .await;

        assert_eq!(outcome.transactions.len(), 1);
        assert_eq!(outcome.stats.layer2_resolved, 0);
        assert_eq!(outcome.stats.layer3_flagged, 1);
        assert_eq!(
            outcome.transactions[0].classified_by,
            ClassifiedBy::ReviewPending
        );
        assert!(outcome.review_needed[0].llm_guess.is_none());
    }

    #[tokio::test]
    async fn test_low_confidence_llm_answer_still_flags() {
        let orch = orchestrator(Some(Arc::new(CannedClassifier { confidence: 0.60 })));
        let outcome = orch
            .classify_batch(
                vec![ambiguous_row("SPINOFF XYZ CORP")],
                &AccountPositionContext::default(),
                "schwab",
                &[],
            )
            .await;

        assert_eq!(outcome.stats.layer2_resolved, 0);
        assert_eq!(outcome.stats.layer3_flagged, 1);
        // The flagged item carries the LLM's take as context for the reviewer.
        assert!(outcome.review_needed[0].llm_guess.is_some());
    }

    #[tokio::test]
    async fn test_llm_outage_degrades_to_review() {
        let orch = orchestrator(Some(Arc::new(OutageClassifier)));
        let outcome = orch
            .classify_batch(
                vec![ambiguous_row("SPINOFF XYZ CORP")],
                &AccountPositionContext::default(),
                "schwab",
                &[],
            )
            .await;

        assert_eq!(outcome.stats.layer3_flagged, 1);
        assert_eq!(
            outcome.transactions[0].classified_by,
            ClassifiedBy::ReviewPending
        );
        assert!(outcome.review_needed[0].llm_guess.is_none());
    }

    #[tokio::test]
    async fn test_option_sell_with_coverage_accepts_as_covered_call() {
        let orch = orchestrator(None);
        let mut positions = AccountPositionContext::default();
        positions
            .equity_positions
            .insert("TSLA".to_string(), Decimal::from(200));

        let outcome = orch
            .classify_batch(
                vec![option_sell("SOLD 2 TSLA DEC 18 2026 150 CALL", "TSLA")],
                &positions,
                "schwab",
                &[],
            )
            .await;

        // 200 shares cover 2 contracts: covered_call at 0.95 passes layer 1.
        assert_eq!(outcome.stats.layer1_resolved, 1);
        assert_eq!(
            outcome.transactions[0].classification.strategy.as_deref(),
            Some("covered_call")
        );
    }
}
