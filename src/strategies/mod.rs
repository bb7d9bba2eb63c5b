pub mod detector;
pub mod rules;
pub mod types;

pub use detector::StrategyDetector;
pub use rules::RuleSet;
pub use types::{
    BrokeragePolicy, OptionActionType, Requirement, StrategyClassification, StrategyRule,
};
