use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Action verb as guessed by the upstream column-mapping parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxAction {
    Buy,
    Sell,
    Dividend,
    Interest,
    Fee,
    Transfer,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentType {
    Equity,
    Etf,
    Options,
    Bond,
    Structured,
    Cash,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionType {
    Call,
    Put,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionDetails {
    pub underlying: String,
    pub option_type: Option<OptionType>,
    pub strike: Option<Decimal>,
    /// Expiry as reported by the brokerage. Left as text on purpose: rule
    /// predicates that need a date parse it and treat failures as "no match".
    pub expiry: Option<String>,
}

/// A single brokerage activity row as produced by the upstream row parser.
/// This pipeline never mutates it, only annotates it with a classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub raw_text: String,
    pub action: TxAction,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub quantity: Decimal,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default)]
    pub amount: Decimal,
    #[serde(default)]
    pub description: String,
    pub instrument_type: InstrumentType,
    #[serde(default)]
    pub option_details: Option<OptionDetails>,
    /// Best-effort confidence of the upstream parser's own guess, if it has one.
    #[serde(default)]
    pub parser_confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationResult {
    pub instrument_type: InstrumentType,
    pub action: TxAction,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub is_closing: Option<bool>,
    #[serde(default)]
    pub underlying: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub complexity_score: Option<u8>,
}

impl ClassificationResult {
    /// Baseline result straight from the upstream parser's fields.
    pub fn from_transaction(tx: &Transaction) -> Self {
        Self {
            instrument_type: tx.instrument_type,
            action: tx.action,
            strategy: None,
            is_closing: None,
            underlying: tx.option_details.as_ref().map(|o| o.underlying.clone()),
            confidence: tx.parser_confidence.unwrap_or(0.5),
            complexity_score: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionPosition {
    /// Brokerage-formatted option ticker, e.g. "AAPL 01/17/2026 150.00 C".
    pub ticker: String,
    pub quantity: Decimal,
}

/// Read-only snapshot of current holdings, supplied by the external position
/// tracker. Absent context is treated as "zero position" everywhere.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountPositionContext {
    /// symbol -> signed share quantity (negative = short)
    pub equity_positions: HashMap<String, Decimal>,
    pub option_positions: Vec<OptionPosition>,
}

impl AccountPositionContext {
    pub fn equity_shares(&self, symbol: &str) -> Decimal {
        self.equity_positions
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}

/// Which tier of the pipeline produced the final answer for a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifiedBy {
    Memory,
    Parser,
    Llm,
    ReviewPending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedTransaction {
    pub transaction: Transaction,
    pub classification: ClassificationResult,
    pub classified_by: ClassifiedBy,
    pub pattern_hash: String,
}
