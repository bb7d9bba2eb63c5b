use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use txn_classifier::config::Config;
use txn_classifier::llm::{BatchClassifier, OpenRouterClassifier};
use txn_classifier::model::{AccountPositionContext, Transaction};
use txn_classifier::patterns::PatternStore;
use txn_classifier::pipeline::Orchestrator;
use txn_classifier::strategies::{RuleSet, StrategyDetector};

/// Input file: one brokerage import as dumped by the upstream row parser.
#[derive(Debug, Deserialize)]
struct ImportFile {
    brokerage: String,
    #[serde(default)]
    positions: AccountPositionContext,
    #[serde(default)]
    trade_history: Vec<String>,
    transactions: Vec<Transaction>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "txn_classifier=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    let path = std::env::args()
        .nth(1)
        .context("usage: txn-classifier <import.json>")?;
    let data = std::fs::read_to_string(&path)
        .with_context(|| format!("reading import file {}", path))?;
    let import: ImportFile =
        serde_json::from_str(&data).with_context(|| format!("parsing import file {}", path))?;

    print_banner(&config, &import);

    let rules = RuleSet::load(config.rules_path.as_deref().map(std::path::Path::new));
    let detector = StrategyDetector::new(rules);
    let store = PatternStore::in_memory();

    let classifier: Option<Arc<dyn BatchClassifier>> =
        if config.llm.enabled && !config.llm.api_key.is_empty() {
            Some(Arc::new(OpenRouterClassifier::new(config.llm.clone())))
        } else {
            info!("🔌 LLM escalation disabled, running memory + parser tiers only");
            None
        };

    let orchestrator = Orchestrator::new(config.pipeline, store, detector, classifier);

    let outcome = orchestrator
        .classify_batch(
            import.transactions,
            &import.positions,
            &import.brokerage,
            &import.trade_history,
        )
        .await;

    for classified in &outcome.transactions {
        println!(
            "{:<14} {:.2}  {}",
            format!("{:?}", classified.classified_by).to_lowercase(),
            classified.classification.confidence,
            classified.transaction.raw_text
        );
    }

    if !outcome.review_needed.is_empty() {
        println!("\n❓ Needs review:");
        for item in &outcome.review_needed {
            println!("   • {} — {}", item.our_interpretation, item.question);
        }
    }

    let memory = orchestrator.store().stats().await;
    println!("\n📊 Batch stats:");
    println!("   • Total rows: {}", outcome.stats.total);
    println!("   • Layer 1 (memory/parser): {}", outcome.stats.layer1_resolved);
    println!("   • Layer 2 (LLM): {}", outcome.stats.layer2_resolved);
    println!("   • Flagged for review: {}", outcome.stats.layer3_flagged);
    println!("   • Memory hits: {}", outcome.stats.memory_hits);
    println!("   • New patterns learned: {}", outcome.stats.new_patterns_learned);
    println!("   • Patterns in memory: {}", memory.total_patterns);

    Ok(())
}

fn print_banner(config: &Config, import: &ImportFile) {
    println!("\n╔═══════════════════════════════════════════════════════════╗");
    println!("║        Brokerage Transaction Classification Pipeline      ║");
    println!("╚═══════════════════════════════════════════════════════════╝");
    println!();
    println!("🏦 Brokerage: {}", import.brokerage);
    println!("📄 Rows: {}", import.transactions.len());
    println!("📊 Thresholds:");
    println!(
        "   • Memory lookup: {:.2}",
        config.pipeline.memory_lookup_threshold
    );
    println!("   • Accept: {:.2}", config.pipeline.accept_threshold);
    println!(
        "   • LLM accept: {:.2}",
        config.pipeline.llm_accept_threshold
    );
    if config.llm.enabled {
        println!("🤖 LLM model: {}", config.llm.model);
    }
    println!();
}
