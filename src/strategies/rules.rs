use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::strategies::types::{BrokeragePolicy, OptionActionType, Requirement, StrategyRule};

/// Rule set plus brokerage policies, loaded once per process and injected
/// into the detector. No module-level caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    pub rules: Vec<StrategyRule>,
    pub brokerage_policies: Vec<BrokeragePolicy>,
}

impl RuleSet {
    /// Load rules from a JSON file, falling back to the built-in set when the
    /// path is absent or unreadable. Rules are kept in ascending complexity so
    /// the most certain strategies are tried first; ties keep file order.
    pub fn load(path: Option<&Path>) -> Self {
        let mut set = match path {
            Some(p) => match Self::from_file(p) {
                Ok(set) => {
                    info!("📐 Loaded {} strategy rules from {}", set.rules.len(), p.display());
                    set
                }
                Err(e) => {
                    warn!("⚠️ Failed to load rules from {}: {}. Using built-in set", p.display(), e);
                    Self::fallback()
                }
            },
            None => Self::fallback(),
        };
        set.rules.sort_by_key(|r| r.complexity_score);
        set
    }

    fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading rule file {}", path.display()))?;
        let set: RuleSet = serde_json::from_str(&data)
            .with_context(|| format!("parsing rule file {}", path.display()))?;
        Ok(set)
    }

    pub fn policy_for(&self, brokerage: &str) -> Option<&BrokeragePolicy> {
        let needle = brokerage.to_lowercase();
        self.brokerage_policies
            .iter()
            .find(|p| p.brokerage == needle)
    }

    /// The hardcoded fallback rule set. Not an exhaustive strategy catalogue —
    /// the engine is the contract, the rules are data.
    pub fn fallback() -> Self {
        let rule = |key: &str, name: &str, at: OptionActionType, req: Requirement, cx: u8| {
            StrategyRule {
                strategy_key: key.to_string(),
                strategy_name: name.to_string(),
                action_type: at,
                requirement: req,
                complexity_score: cx,
            }
        };

        RuleSet {
            rules: vec![
                rule(
                    "covered_call",
                    "Covered Call",
                    OptionActionType::SellCall,
                    Requirement::LongEquityCoversContracts,
                    1,
                ),
                rule(
                    "leaps_call",
                    "LEAPS Call",
                    OptionActionType::BuyCall,
                    Requirement::DaysToExpiryOver { days: 365 },
                    1,
                ),
                rule(
                    "leaps_put",
                    "LEAPS Put",
                    OptionActionType::BuyPut,
                    Requirement::DaysToExpiryOver { days: 365 },
                    1,
                ),
                rule(
                    "long_call",
                    "Long Call",
                    OptionActionType::BuyCall,
                    Requirement::Always,
                    2,
                ),
                rule(
                    "long_put",
                    "Long Put",
                    OptionActionType::BuyPut,
                    Requirement::Always,
                    2,
                ),
                rule(
                    "call_credit_spread",
                    "Call Credit Spread",
                    OptionActionType::SellCall,
                    Requirement::PairedLongOptionBetterStrike,
                    2,
                ),
                rule(
                    "put_credit_spread",
                    "Put Credit Spread",
                    OptionActionType::SellPut,
                    Requirement::PairedLongOptionBetterStrike,
                    2,
                ),
                // Spreads outrank this: SufficientCash always matches, so it
                // must come after any predicate that checks real state.
                rule(
                    "cash_secured_put",
                    "Cash-Secured Put",
                    OptionActionType::SellPut,
                    Requirement::SufficientCash,
                    3,
                ),
                rule(
                    "likely_covered_call",
                    "Likely Covered Call",
                    OptionActionType::SellCall,
                    Requirement::UnderlyingInHistoryNotHeld,
                    4,
                ),
                rule(
                    "naked_call",
                    "Naked Call",
                    OptionActionType::SellCall,
                    Requirement::NoEquityNoPairedOption,
                    5,
                ),
                rule(
                    "naked_put",
                    "Naked Put",
                    OptionActionType::SellPut,
                    Requirement::NoEquityNoPairedOption,
                    5,
                ),
            ],
            brokerage_policies: vec![
                BrokeragePolicy {
                    brokerage: "wells_fargo".to_string(),
                    allows_naked_options: false,
                    sell_call_default: "covered_call".to_string(),
                    sell_put_default: "cash_secured_put".to_string(),
                },
                BrokeragePolicy {
                    brokerage: "edward_jones".to_string(),
                    allows_naked_options: false,
                    sell_call_default: "covered_call".to_string(),
                    sell_put_default: "cash_secured_put".to_string(),
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_is_complexity_ordered_after_load() {
        let set = RuleSet::load(None);
        let scores: Vec<u8> = set.rules.iter().map(|r| r.complexity_score).collect();
        let mut sorted = scores.clone();
        sorted.sort();
        assert_eq!(scores, sorted);
        // Covered call must come before naked call.
        let covered = set.rules.iter().position(|r| r.strategy_key == "covered_call");
        let naked = set.rules.iter().position(|r| r.strategy_key == "naked_call");
        assert!(covered < naked);
    }

    #[test]
    fn test_policy_lookup_is_case_insensitive() {
        let set = RuleSet::fallback();
        assert!(set.policy_for("Wells_Fargo").is_some());
        assert!(set.policy_for("schwab").is_none());
    }

    #[test]
    fn test_rule_file_round_trips() {
        let set = RuleSet::fallback();
        let json = serde_json::to_string(&set).unwrap();
        let parsed: RuleSet = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.rules.len(), set.rules.len());
    }

    #[test]
    fn test_missing_file_falls_back() {
        let set = RuleSet::load(Some(Path::new("/nonexistent/rules.json")));
        assert!(!set.rules.is_empty());
    }
}
