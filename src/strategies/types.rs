use serde::{Deserialize, Serialize};

/// Action token derived from `(action, option_type)`. The generic variants
/// cover rows where the option type could not be parsed; a generic rule token
/// matches either specific token on the same side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionActionType {
    SellCall,
    SellPut,
    BuyCall,
    BuyPut,
    SellCallOrPut,
    BuyCallOrPut,
}

impl OptionActionType {
    pub fn is_sell(&self) -> bool {
        matches!(
            self,
            OptionActionType::SellCall | OptionActionType::SellPut | OptionActionType::SellCallOrPut
        )
    }

    pub fn is_generic(&self) -> bool {
        matches!(
            self,
            OptionActionType::SellCallOrPut | OptionActionType::BuyCallOrPut
        )
    }

    /// Whether a rule declared for `self` applies to a derived token.
    pub fn matches(&self, derived: OptionActionType) -> bool {
        if *self == derived {
            return true;
        }
        // Generic rule tokens accept either specific token on their side.
        self.is_generic() && self.is_sell() == derived.is_sell() && !derived.is_generic()
    }
}

/// Rule predicate over current account state. Tagged variants instead of
/// string-keyed requirement names so a rule file cannot reference a predicate
/// that does not exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Requirement {
    /// Long equity in the same account with shares >= contracts * 100.
    LongEquityCoversContracts,
    /// Cash collateral cannot be verified from here; matches at moderate
    /// confidence.
    SufficientCash,
    /// A long option on the same underlying/expiry with a better strike
    /// (lower for calls, higher for puts) — a spread leg.
    PairedLongOptionBetterStrike,
    /// Days to expiry strictly greater than `days` (LEAPS detection).
    DaysToExpiryOver { days: i64 },
    /// Underlying seen in trade history but not currently held: the shares
    /// were likely transferred out or the history is incomplete.
    UnderlyingInHistoryNotHeld,
    /// No equity position and no paired long option — a naked position.
    NoEquityNoPairedOption,
    /// Always satisfied.
    Always,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRule {
    pub strategy_key: String,
    pub strategy_name: String,
    pub action_type: OptionActionType,
    pub requirement: Requirement,
    pub complexity_score: u8,
}

/// What a brokerage structurally allows. Brokerages that forbid uncovered
/// writing get their naked/unknown sell-side results rewritten to the
/// prescribed defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokeragePolicy {
    pub brokerage: String,
    pub allows_naked_options: bool,
    pub sell_call_default: String,
    pub sell_put_default: String,
}

/// Outcome of a requirement evaluation: whether it held, how sure we are,
/// and a human-readable trace for the review queue.
#[derive(Debug, Clone)]
pub struct RequirementOutcome {
    pub matched: bool,
    pub confidence: f64,
    pub details: String,
}

impl RequirementOutcome {
    pub fn no_match(details: impl Into<String>) -> Self {
        Self {
            matched: false,
            confidence: 0.0,
            details: details.into(),
        }
    }

    pub fn matched(confidence: f64, details: impl Into<String>) -> Self {
        Self {
            matched: true,
            confidence,
            details: details.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyClassification {
    pub strategy_key: String,
    pub strategy_name: String,
    pub confidence: f64,
    pub complexity_score: u8,
    pub details: String,
    pub brokerage_override: bool,
}

pub const UNKNOWN_STRATEGY_KEY: &str = "unknown_option_strategy";

/// Strategy labels that only make sense on the sell side.
pub const SELL_ONLY_KEYS: &[&str] = &[
    "covered_call",
    "likely_covered_call",
    "cash_secured_put",
    "naked_call",
    "naked_put",
    "call_credit_spread",
    "put_credit_spread",
];

/// Strategy labels that only make sense on the buy side.
pub const BUY_ONLY_KEYS: &[&str] = &["long_call", "long_put", "leaps_call", "leaps_put"];
