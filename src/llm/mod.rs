pub mod client;

pub use client::{BatchClassifier, EscalationRow, LlmClassification, LlmError, OpenRouterClassifier};
