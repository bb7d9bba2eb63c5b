use rust_decimal::Decimal;

use crate::model::{AccountPositionContext, InstrumentType, Transaction, TxAction};

/// Keywords that mark a corporate action / reorg row. These descriptions are
/// structurally messy and the parser guess is rarely trustworthy.
const CORPORATE_ACTION_KEYWORDS: &[&str] = &[
    "merger", "reorganization", "reorg", "spinoff", "spin-off", "split", "reverse split",
    "tender", "acquisition", "exchange offer", "conversion", "recapitalization",
];

/// Multi-leg option strategy vocabulary. One row of a spread cannot be
/// classified on its own with any certainty.
const MULTI_LEG_KEYWORDS: &[&str] = &[
    "spread", "straddle", "strangle", "butterfly", "condor", "collar", "combo", "iron",
    "roll", "rolled",
];

const LONG_DESCRIPTION_CHARS: usize = 120;

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    let lower = haystack.to_lowercase();
    needles.iter().any(|kw| lower.contains(kw))
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Deterministic confidence score for a parsed transaction: no I/O, no
/// randomness, stable rounding so tests can assert exact values.
///
/// `memory_confidence` is the corroborating confidence of a pattern-memory
/// hit, if any; agreement with memory at >= 0.90 lifts the result to >= 0.95.
pub fn score(
    tx: &Transaction,
    raw_text: &str,
    positions: Option<&AccountPositionContext>,
    memory_confidence: Option<f64>,
) -> f64 {
    let text = format!("{} {}", raw_text, tx.description);

    let has_symbol = !tx.symbol.trim().is_empty();
    let has_quantity = tx.quantity != Decimal::ZERO;
    let has_price = tx.price != Decimal::ZERO;

    // Base score, highest-signal cases checked first.
    let mut score = if contains_any(&text, CORPORATE_ACTION_KEYWORDS) {
        0.45
    } else if contains_any(&text, MULTI_LEG_KEYWORDS) {
        0.50
    } else if matches!(tx.instrument_type, InstrumentType::Equity | InstrumentType::Etf)
        && matches!(tx.action, TxAction::Buy | TxAction::Sell)
        && has_symbol
    {
        if has_quantity && has_price {
            0.97
        } else if has_quantity || has_price {
            0.93
        } else {
            0.90
        }
    } else if matches!(tx.action, TxAction::Dividend | TxAction::Interest) {
        0.96
    } else if matches!(tx.action, TxAction::Fee | TxAction::Transfer) {
        0.94
    } else if tx.instrument_type == InstrumentType::Options && has_symbol && has_quantity {
        if has_price {
            0.78
        } else {
            0.70
        }
    } else if matches!(tx.instrument_type, InstrumentType::Bond | InstrumentType::Structured)
        && tx.action != TxAction::Other
    {
        if has_quantity && has_price {
            0.78
        } else {
            0.68
        }
    } else if tx.instrument_type == InstrumentType::Unknown {
        0.40
    } else {
        // Fall back to the upstream classifier's own confidence, scaled down.
        tx.parser_confidence.unwrap_or(0.5) * 0.80
    };

    // Sell-side ambiguity: a sell without position context could be a short
    // open or a long close. Worse for options, where the distinction changes
    // the strategy entirely.
    if tx.action == TxAction::Sell {
        let is_option = tx.instrument_type == InstrumentType::Options;
        match positions {
            None => {
                score -= if is_option { 0.08 } else { 0.03 };
            }
            Some(ctx) => {
                let held = ctx.equity_shares(&tx.symbol);
                if is_option {
                    let underlying = tx
                        .option_details
                        .as_ref()
                        .map(|o| o.underlying.as_str())
                        .unwrap_or(tx.symbol.as_str());
                    let has_option_position = ctx
                        .option_positions
                        .iter()
                        .any(|p| p.ticker.contains(underlying) && p.quantity > Decimal::ZERO);
                    if ctx.equity_shares(underlying) <= Decimal::ZERO && !has_option_position {
                        // Could be opening-short or closing-long; we can't tell.
                        score -= 0.15;
                    }
                } else if held >= tx.quantity && held > Decimal::ZERO {
                    score += 0.02;
                }
            }
        }
    }

    // Description complexity penalty.
    if tx.description.len() > LONG_DESCRIPTION_CHARS {
        score -= 0.05;
    }
    if tx.description.matches('(').count() >= 2 {
        score -= 0.05;
    }

    // Catch-all actions are never trusted past the review threshold.
    if tx.action == TxAction::Other {
        score = score.min(0.50);
    }

    // Memory agreement is strong evidence.
    if let Some(mem) = memory_confidence {
        if mem >= 0.90 {
            score = score.max(0.95);
        }
    }

    round4(score.clamp(0.0, 1.0))
}
