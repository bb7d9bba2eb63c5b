use chrono::{NaiveDate, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;
use tracing::debug;

use crate::model::{AccountPositionContext, OptionDetails, OptionType, Transaction, TxAction};
use crate::strategies::rules::RuleSet;
use crate::strategies::types::{
    OptionActionType, Requirement, RequirementOutcome, StrategyClassification, BUY_ONLY_KEYS,
    SELL_ONLY_KEYS, UNKNOWN_STRATEGY_KEY,
};

lazy_static! {
    /// Brokerage-formatted option position ticker, e.g. "AAPL 01/17/2026 150.00 C".
    static ref OPTION_TICKER_RE: Regex =
        Regex::new(r"^(?P<u>[A-Z.]+)\s+(?P<d>\d{1,2}/\d{1,2}/\d{2,4})\s+(?P<s>\d+(\.\d+)?)\s+(?P<t>[CP])$")
            .unwrap();
}

#[derive(Debug, Clone)]
struct ParsedOptionPosition {
    underlying: String,
    expiry: Option<NaiveDate>,
    strike: Decimal,
    option_type: OptionType,
    quantity: Decimal,
}

fn parse_expiry(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    for fmt in ["%Y-%m-%d", "%m/%d/%Y", "%m/%d/%y", "%b %d %Y", "%b %d, %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(date);
        }
    }
    None
}

fn parse_option_position(ticker: &str, quantity: Decimal) -> Option<ParsedOptionPosition> {
    let caps = OPTION_TICKER_RE.captures(ticker.trim())?;
    let strike: Decimal = caps.name("s")?.as_str().parse().ok()?;
    let option_type = match caps.name("t")?.as_str() {
        "C" => OptionType::Call,
        _ => OptionType::Put,
    };
    Some(ParsedOptionPosition {
        underlying: caps.name("u")?.as_str().to_string(),
        expiry: parse_expiry(caps.name("d")?.as_str()),
        strike,
        option_type,
        quantity,
    })
}

fn strategy_name_for(key: &str) -> String {
    match key {
        "covered_call" => "Covered Call".to_string(),
        "likely_covered_call" => "Likely Covered Call".to_string(),
        "cash_secured_put" => "Cash-Secured Put".to_string(),
        "naked_call" => "Naked Call".to_string(),
        "naked_put" => "Naked Put".to_string(),
        "long_call" => "Long Call".to_string(),
        "long_put" => "Long Put".to_string(),
        "leaps_call" => "LEAPS Call".to_string(),
        "leaps_put" => "LEAPS Put".to_string(),
        "call_credit_spread" => "Call Credit Spread".to_string(),
        "put_credit_spread" => "Put Credit Spread".to_string(),
        other => other.replace('_', " "),
    }
}

/// Rule engine for option transactions. The rule set is injected once at
/// construction; every classification is a pure walk over it plus the two
/// unconditional post-guards.
pub struct StrategyDetector {
    rules: RuleSet,
}

impl StrategyDetector {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    pub fn derive_action_type(
        action: TxAction,
        option_type: Option<OptionType>,
    ) -> Option<OptionActionType> {
        match (action, option_type) {
            (TxAction::Sell, Some(OptionType::Call)) => Some(OptionActionType::SellCall),
            (TxAction::Sell, Some(OptionType::Put)) => Some(OptionActionType::SellPut),
            (TxAction::Sell, None) => Some(OptionActionType::SellCallOrPut),
            (TxAction::Buy, Some(OptionType::Call)) => Some(OptionActionType::BuyCall),
            (TxAction::Buy, Some(OptionType::Put)) => Some(OptionActionType::BuyPut),
            (TxAction::Buy, None) => Some(OptionActionType::BuyCallOrPut),
            _ => None,
        }
    }

    /// Classify an option transaction into a strategy. Absent position
    /// context is treated as "zero position"; malformed dates or position
    /// tickers make the affected requirement fail, never the call.
    pub fn classify(
        &self,
        tx: &Transaction,
        positions: Option<&AccountPositionContext>,
        option_details: &OptionDetails,
        trade_history_tickers: &[String],
        brokerage: Option<&str>,
    ) -> StrategyClassification {
        let empty = AccountPositionContext::default();
        let ctx = positions.unwrap_or(&empty);

        let derived = match Self::derive_action_type(tx.action, option_details.option_type) {
            Some(d) => d,
            None => {
                return StrategyClassification {
                    strategy_key: UNKNOWN_STRATEGY_KEY.to_string(),
                    strategy_name: "Unknown Option Strategy".to_string(),
                    confidence: 0.30,
                    complexity_score: 0,
                    details: format!("action {:?} is not an option open/close", tx.action),
                    brokerage_override: false,
                }
            }
        };

        let mut result = self.first_match(tx, ctx, option_details, trade_history_tickers, derived);

        // Post-processing guards run on every result, including unknown.
        if let Some(name) = brokerage {
            result = self.apply_brokerage_override(result, derived, name);
        }
        result = self.apply_side_guard(result, tx.action, option_details, brokerage);

        result
    }

    fn first_match(
        &self,
        tx: &Transaction,
        ctx: &AccountPositionContext,
        option_details: &OptionDetails,
        trade_history: &[String],
        derived: OptionActionType,
    ) -> StrategyClassification {
        for rule in &self.rules.rules {
            if !rule.action_type.matches(derived) {
                continue;
            }
            let outcome =
                self.evaluate(&rule.requirement, tx, ctx, option_details, trade_history);
            if outcome.matched {
                debug!(
                    "Rule {} matched: {}",
                    rule.strategy_key, outcome.details
                );
                return StrategyClassification {
                    strategy_key: rule.strategy_key.clone(),
                    strategy_name: rule.strategy_name.clone(),
                    confidence: outcome.confidence,
                    complexity_score: rule.complexity_score,
                    details: outcome.details,
                    brokerage_override: false,
                };
            }
        }

        StrategyClassification {
            strategy_key: UNKNOWN_STRATEGY_KEY.to_string(),
            strategy_name: "Unknown Option Strategy".to_string(),
            confidence: 0.30,
            complexity_score: 0,
            details: format!(
                "no rule requirement satisfied for {:?} on {}",
                derived, option_details.underlying
            ),
            brokerage_override: false,
        }
    }

    fn evaluate(
        &self,
        requirement: &Requirement,
        tx: &Transaction,
        ctx: &AccountPositionContext,
        option_details: &OptionDetails,
        trade_history: &[String],
    ) -> RequirementOutcome {
        let underlying = option_details.underlying.as_str();
        let shares = ctx.equity_shares(underlying);
        let contracts = tx.quantity.abs();

        match requirement {
            Requirement::LongEquityCoversContracts => {
                let needed = contracts * Decimal::from(100);
                if shares >= needed && needed > Decimal::ZERO {
                    RequirementOutcome::matched(
                        0.95,
                        format!("{} shares of {} cover {} contracts", shares, underlying, contracts),
                    )
                } else {
                    RequirementOutcome::no_match(format!(
                        "{} shares of {} do not cover {} contracts",
                        shares, underlying, contracts
                    ))
                }
            }
            Requirement::SufficientCash => RequirementOutcome::matched(
                0.70,
                "cash collateral assumed; not verifiable from transaction data",
            ),
            Requirement::PairedLongOptionBetterStrike => {
                self.paired_long_option(ctx, option_details)
            }
            Requirement::DaysToExpiryOver { days } => {
                let expiry = option_details.expiry.as_deref().and_then(parse_expiry);
                match expiry {
                    Some(date) => {
                        let dte = (date - Utc::now().date_naive()).num_days();
                        if dte > *days {
                            RequirementOutcome::matched(
                                0.85,
                                format!("{} days to expiry > {}", dte, days),
                            )
                        } else {
                            RequirementOutcome::no_match(format!(
                                "{} days to expiry <= {}",
                                dte, days
                            ))
                        }
                    }
                    // Missing or unparseable expiry is a failed requirement,
                    // not an error.
                    None => RequirementOutcome::no_match("expiry missing or unparseable"),
                }
            }
            Requirement::UnderlyingInHistoryNotHeld => {
                let in_history = trade_history
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(underlying));
                if in_history && shares == Decimal::ZERO {
                    RequirementOutcome::matched(
                        0.60,
                        format!("{} traded before but not currently held", underlying),
                    )
                } else {
                    RequirementOutcome::no_match(format!(
                        "{} in history: {}, shares held: {}",
                        underlying, in_history, shares
                    ))
                }
            }
            Requirement::NoEquityNoPairedOption => {
                let paired = ctx.option_positions.iter().any(|p| {
                    p.quantity > Decimal::ZERO
                        && parse_option_position(&p.ticker, p.quantity)
                            .map(|parsed| parsed.underlying == underlying)
                            .unwrap_or(false)
                });
                if shares <= Decimal::ZERO && !paired {
                    RequirementOutcome::matched(
                        0.65,
                        format!("no equity and no long option on {}", underlying),
                    )
                } else {
                    RequirementOutcome::no_match(format!(
                        "{} shares or a paired option exist for {}",
                        shares, underlying
                    ))
                }
            }
            Requirement::Always => RequirementOutcome::matched(0.90, "unconditional"),
        }
    }

    fn paired_long_option(
        &self,
        ctx: &AccountPositionContext,
        option_details: &OptionDetails,
    ) -> RequirementOutcome {
        let (strike, option_type) = match (option_details.strike, option_details.option_type) {
            (Some(s), Some(t)) => (s, t),
            _ => return RequirementOutcome::no_match("strike or option type unknown"),
        };
        let expiry = option_details.expiry.as_deref().and_then(parse_expiry);

        for pos in &ctx.option_positions {
            if pos.quantity <= Decimal::ZERO {
                continue;
            }
            let parsed = match parse_option_position(&pos.ticker, pos.quantity) {
                Some(p) => p,
                None => continue, // malformed position ticker, skip it
            };
            if parsed.underlying != option_details.underlying || parsed.option_type != option_type {
                continue;
            }
            match (expiry, parsed.expiry) {
                (Some(a), Some(b)) if a != b => continue,
                _ => {}
            }
            let better = match option_type {
                OptionType::Call => parsed.strike < strike,
                OptionType::Put => parsed.strike > strike,
            };
            if better {
                return RequirementOutcome::matched(
                    0.85,
                    format!(
                        "long {} {} at {} pairs against short strike {}",
                        parsed.underlying,
                        match option_type {
                            OptionType::Call => "call",
                            OptionType::Put => "put",
                        },
                        parsed.strike,
                        strike
                    ),
                );
            }
        }
        RequirementOutcome::no_match("no paired long option with a better strike")
    }

    /// Some brokerages structurally forbid uncovered writing. For those, a
    /// naked or unknown sell-side result is rewritten to the brokerage's
    /// prescribed default, and "likely" variants are promoted to confirmed.
    /// Documented policy decision: the requirement that produced "unknown" is
    /// not re-checked here.
    fn apply_brokerage_override(
        &self,
        result: StrategyClassification,
        derived: OptionActionType,
        brokerage: &str,
    ) -> StrategyClassification {
        let policy = match self.rules.policy_for(brokerage) {
            Some(p) if !p.allows_naked_options && derived.is_sell() => p,
            _ => return result,
        };

        let rewritten_key = match result.strategy_key.as_str() {
            "naked_call" | "naked_put" | UNKNOWN_STRATEGY_KEY => match derived {
                OptionActionType::SellPut => policy.sell_put_default.clone(),
                _ => policy.sell_call_default.clone(),
            },
            "likely_covered_call" => policy.sell_call_default.clone(),
            _ => return result,
        };

        StrategyClassification {
            strategy_name: strategy_name_for(&rewritten_key),
            strategy_key: rewritten_key,
            confidence: 0.95,
            complexity_score: result.complexity_score,
            details: format!(
                "{} does not permit uncovered option writing; {} rewritten to brokerage default",
                brokerage, result.strategy_key
            ),
            brokerage_override: true,
        }
    }

    /// Unconditional last-line guard: a buy can never carry a sell-only label
    /// and a sell can never carry a buy-only label, whatever the rule set did.
    fn apply_side_guard(
        &self,
        result: StrategyClassification,
        action: TxAction,
        option_details: &OptionDetails,
        brokerage: Option<&str>,
    ) -> StrategyClassification {
        let key = result.strategy_key.as_str();
        let is_put = option_details.option_type == Some(OptionType::Put);

        if action == TxAction::Buy && SELL_ONLY_KEYS.contains(&key) {
            let fixed = if is_put { "long_put" } else { "long_call" };
            return StrategyClassification {
                strategy_key: fixed.to_string(),
                strategy_name: strategy_name_for(fixed),
                confidence: 0.60,
                complexity_score: result.complexity_score,
                details: format!("buy transaction carried sell-only label {}; rewritten", key),
                brokerage_override: result.brokerage_override,
            };
        }

        if action == TxAction::Sell && BUY_ONLY_KEYS.contains(&key) {
            let policy = brokerage.and_then(|b| self.rules.policy_for(b));
            let fixed = if is_put {
                policy
                    .map(|p| p.sell_put_default.clone())
                    .unwrap_or_else(|| "cash_secured_put".to_string())
            } else {
                policy
                    .map(|p| p.sell_call_default.clone())
                    .unwrap_or_else(|| "covered_call".to_string())
            };
            return StrategyClassification {
                strategy_name: strategy_name_for(&fixed),
                strategy_key: fixed,
                confidence: 0.60,
                complexity_score: result.complexity_score,
                details: format!("sell transaction carried buy-only label {}; rewritten", key),
                brokerage_override: result.brokerage_override,
            };
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InstrumentType, OptionPosition};
    use crate::strategies::types::StrategyRule;
    use std::collections::HashMap;

    fn option_tx(action: TxAction, contracts: i64) -> Transaction {
        Transaction {
            raw_text: "SOLD 5 AAPL CALL".to_string(),
            action,
            symbol: "AAPL".to_string(),
            quantity: Decimal::from(contracts),
            price: Decimal::new(250, 2),
            amount: Decimal::from(1250),
            description: String::new(),
            instrument_type: InstrumentType::Options,
            option_details: None,
            parser_confidence: None,
        }
    }

    fn details(option_type: Option<OptionType>) -> OptionDetails {
        OptionDetails {
            underlying: "AAPL".to_string(),
            option_type,
            strike: Some(Decimal::from(150)),
            expiry: Some("01/17/2026".to_string()),
        }
    }

    fn detector() -> StrategyDetector {
        StrategyDetector::new(RuleSet::load(None))
    }

    fn ctx_with_shares(symbol: &str, shares: i64) -> AccountPositionContext {
        AccountPositionContext {
            equity_positions: HashMap::from([(symbol.to_string(), Decimal::from(shares))]),
            option_positions: vec![],
        }
    }

    #[test]
    fn test_covered_call_when_shares_cover() {
        let d = detector();
        let tx = option_tx(TxAction::Sell, 5);
        let ctx = ctx_with_shares("AAPL", 500);
        let result = d.classify(&tx, Some(&ctx), &details(Some(OptionType::Call)), &[], None);
        assert_eq!(result.strategy_key, "covered_call");
        assert!(result.confidence >= 0.90);
        assert!(!result.brokerage_override);
    }

    #[test]
    fn test_insufficient_shares_is_not_covered() {
        let d = detector();
        let tx = option_tx(TxAction::Sell, 5);
        let ctx = ctx_with_shares("AAPL", 400); // needs 500
        let result = d.classify(&tx, Some(&ctx), &details(Some(OptionType::Call)), &[], None);
        assert_ne!(result.strategy_key, "covered_call");
    }

    #[test]
    fn test_cash_secured_put() {
        let d = detector();
        let tx = option_tx(TxAction::Sell, 2);
        let result = d.classify(
            &tx,
            Some(&ctx_with_shares("MSFT", 100)),
            &details(Some(OptionType::Put)),
            &[],
            None,
        );
        assert_eq!(result.strategy_key, "cash_secured_put");
    }

    #[test]
    fn test_leaps_detection() {
        let d = detector();
        let tx = option_tx(TxAction::Buy, 1);
        let mut det = details(Some(OptionType::Call));
        det.expiry = Some("01/15/2030".to_string());
        let result = d.classify(&tx, None, &det, &[], None);
        assert_eq!(result.strategy_key, "leaps_call");
    }

    #[test]
    fn test_unparseable_expiry_falls_back_to_long_call() {
        let d = detector();
        let tx = option_tx(TxAction::Buy, 1);
        let mut det = details(Some(OptionType::Call));
        det.expiry = Some("sometime next decade".to_string());
        let result = d.classify(&tx, None, &det, &[], None);
        assert_eq!(result.strategy_key, "long_call");
    }

    #[test]
    fn test_call_credit_spread() {
        let d = detector();
        let tx = option_tx(TxAction::Sell, 1);
        let ctx = AccountPositionContext {
            equity_positions: HashMap::new(),
            option_positions: vec![OptionPosition {
                ticker: "AAPL 01/17/2026 140.00 C".to_string(),
                quantity: Decimal::from(1),
            }],
        };
        let result = d.classify(&tx, Some(&ctx), &details(Some(OptionType::Call)), &[], None);
        assert_eq!(result.strategy_key, "call_credit_spread");
    }

    #[test]
    fn test_worse_strike_is_not_a_spread() {
        let d = detector();
        let tx = option_tx(TxAction::Sell, 1);
        let ctx = AccountPositionContext {
            equity_positions: HashMap::new(),
            option_positions: vec![OptionPosition {
                ticker: "AAPL 01/17/2026 160.00 C".to_string(),
                quantity: Decimal::from(1),
            }],
        };
        let result = d.classify(&tx, Some(&ctx), &details(Some(OptionType::Call)), &[], None);
        assert_ne!(result.strategy_key, "call_credit_spread");
    }

    #[test]
    fn test_likely_covered_call_from_history() {
        let d = detector();
        let tx = option_tx(TxAction::Sell, 1);
        let result = d.classify(
            &tx,
            None,
            &details(Some(OptionType::Call)),
            &["AAPL".to_string()],
            None,
        );
        assert_eq!(result.strategy_key, "likely_covered_call");
    }

    #[test]
    fn test_naked_call_without_any_backing() {
        let d = detector();
        let tx = option_tx(TxAction::Sell, 5);
        let result = d.classify(&tx, None, &details(Some(OptionType::Call)), &[], None);
        assert_eq!(result.strategy_key, "naked_call");
    }

    #[test]
    fn test_wells_fargo_override_rewrites_naked_to_covered() {
        let d = detector();
        let tx = option_tx(TxAction::Sell, 5);
        let result = d.classify(
            &tx,
            None,
            &details(Some(OptionType::Call)),
            &[],
            Some("wells_fargo"),
        );
        assert_eq!(result.strategy_key, "covered_call");
        assert!((result.confidence - 0.95).abs() < 1e-9);
        assert!(result.brokerage_override);
    }

    #[test]
    fn test_wells_fargo_promotes_likely_covered() {
        let d = detector();
        let tx = option_tx(TxAction::Sell, 1);
        let result = d.classify(
            &tx,
            None,
            &details(Some(OptionType::Call)),
            &["AAPL".to_string()],
            Some("wells_fargo"),
        );
        assert_eq!(result.strategy_key, "covered_call");
        assert!(result.brokerage_override);
    }

    #[test]
    fn test_unknown_type_sell_only_matches_generic_rules() {
        let d = detector();
        let tx = option_tx(TxAction::Sell, 1);
        // Unknown option type: covered-call (specific) rules must not fire.
        let result = d.classify(&tx, Some(&ctx_with_shares("AAPL", 500)), &details(None), &[], None);
        assert_ne!(result.strategy_key, "covered_call");
    }

    #[test]
    fn test_unknown_sell_under_policy_brokerage_gets_default() {
        let d = detector();
        let tx = option_tx(TxAction::Sell, 1);
        let result = d.classify(&tx, None, &details(None), &[], Some("wells_fargo"));
        assert_eq!(result.strategy_key, "covered_call");
        assert!(result.brokerage_override);
    }

    #[test]
    fn test_buy_never_carries_sell_only_label() {
        // Broken rule set: labels buys as covered calls.
        let mut rules = RuleSet::fallback();
        rules.rules.insert(
            0,
            StrategyRule {
                strategy_key: "covered_call".to_string(),
                strategy_name: "Covered Call".to_string(),
                action_type: OptionActionType::BuyCall,
                requirement: Requirement::Always,
                complexity_score: 0,
            },
        );
        let d = StrategyDetector::new(rules);
        let tx = option_tx(TxAction::Buy, 1);
        let result = d.classify(&tx, None, &details(Some(OptionType::Call)), &[], None);
        assert_eq!(result.strategy_key, "long_call");
    }

    #[test]
    fn test_sell_never_carries_buy_only_label() {
        let mut rules = RuleSet::fallback();
        rules.rules.insert(
            0,
            StrategyRule {
                strategy_key: "long_put".to_string(),
                strategy_name: "Long Put".to_string(),
                action_type: OptionActionType::SellPut,
                requirement: Requirement::Always,
                complexity_score: 0,
            },
        );
        let d = StrategyDetector::new(rules);
        let tx = option_tx(TxAction::Sell, 1);
        let result = d.classify(&tx, None, &details(Some(OptionType::Put)), &[], None);
        assert_eq!(result.strategy_key, "cash_secured_put");
    }
}
