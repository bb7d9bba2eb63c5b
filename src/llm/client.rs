use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::model::{AccountPositionContext, ClassificationResult, InstrumentType, TxAction};

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM API returned status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("LLM request timed out")]
    Timeout,
    #[error("LLM response malformed: {0}")]
    MalformedResponse(String),
    #[error("LLM transport error: {0}")]
    Transport(String),
}

/// One ambiguous row as sent to the external classifier.
#[derive(Debug, Clone, Serialize)]
pub struct EscalationRow {
    pub index: usize,
    pub raw_text: String,
    pub parser_guess: ClassificationResult,
}

/// One classification as returned by the external classifier, same order as
/// the request rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmClassification {
    pub instrument_type: InstrumentType,
    pub action: TxAction,
    #[serde(default)]
    pub strategy: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// External batch classification service (§6). The orchestrator only knows
/// this trait; tests plug in canned implementations.
#[async_trait]
pub trait BatchClassifier: Send + Sync {
    async fn classify_batch(
        &self,
        rows: &[EscalationRow],
        positions: &AccountPositionContext,
        brokerage: &str,
    ) -> Result<Vec<LlmClassification>, LlmError>;
}

/// OpenRouter-backed implementation. Any transport, status or parse failure
/// is a whole-batch failure; the caller degrades to parser guesses.
pub struct OpenRouterClassifier {
    client: Client,
    cfg: LlmConfig,
}

impl OpenRouterClassifier {
    pub fn new(cfg: LlmConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client, cfg }
    }

    fn build_prompt(
        rows: &[EscalationRow],
        positions: &AccountPositionContext,
        brokerage: &str,
    ) -> String {
        let rows_json = serde_json::to_string_pretty(rows).unwrap_or_default();
        let positions_json = serde_json::to_string(positions).unwrap_or_default();
        format!(
            "You are a brokerage-transaction classification expert. Classify each \
transaction row below from brokerage \"{brokerage}\".\n\n\
Current account positions (read-only context):\n{positions_json}\n\n\
Transactions:\n{rows_json}\n\n\
Return STRICTLY a JSON array with exactly one object per input row, in the \
same order. Each object must have fields: \"instrument_type\" (one of equity, \
etf, options, bond, structured, cash, unknown), \"action\" (one of buy, sell, \
dividend, interest, fee, transfer, other), \"strategy\" (option strategy key \
or null), \"confidence\" (0.0 to 1.0), \"reasoning\" (one short sentence). \
No markdown, no commentary, just the array."
        )
    }

    fn parse_content(content: &str, expected: usize) -> Result<Vec<LlmClassification>, LlmError> {
        // Tolerate markdown fences even though the prompt forbids them.
        let clean = content
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();

        let results: Vec<LlmClassification> = serde_json::from_str(clean)
            .map_err(|e| LlmError::MalformedResponse(format!("{}: {}", e, clean)))?;

        if results.len() != expected {
            return Err(LlmError::MalformedResponse(format!(
                "expected {} classifications, got {}",
                expected,
                results.len()
            )));
        }
        Ok(results)
    }
}

#[async_trait]
impl BatchClassifier for OpenRouterClassifier {
    async fn classify_batch(
        &self,
        rows: &[EscalationRow],
        positions: &AccountPositionContext,
        brokerage: &str,
    ) -> Result<Vec<LlmClassification>, LlmError> {
        let prompt = Self::build_prompt(rows, positions, brokerage);
        let payload = json!({
            "model": self.cfg.model,
            "messages": [
                { "role": "system", "content": "You output strictly valid JSON." },
                { "role": "user", "content": prompt }
            ],
            "temperature": 0.0
        });

        let mut attempt = 0u32;
        loop {
            let send_result = self
                .client
                .post(&self.cfg.base_url)
                .bearer_auth(&self.cfg.api_key)
                .json(&payload)
                .send()
                .await;

            match send_result {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        let body = response.text().await.unwrap_or_default();
                        if status.as_u16() == 429 && attempt < self.cfg.max_retries {
                            attempt += 1;
                            warn!("⏳ LLM rate limited, retry {} of {}", attempt, self.cfg.max_retries);
                            sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                            continue;
                        }
                        return Err(LlmError::HttpStatus {
                            status: status.as_u16(),
                            body,
                        });
                    }

                    let body: serde_json::Value = response
                        .json()
                        .await
                        .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;
                    let content = body["choices"][0]["message"]["content"]
                        .as_str()
                        .ok_or_else(|| {
                            LlmError::MalformedResponse("missing message content".to_string())
                        })?;
                    debug!("LLM returned {} chars for {} rows", content.len(), rows.len());
                    return Self::parse_content(content, rows.len());
                }
                Err(e) => {
                    if e.is_timeout() {
                        return Err(LlmError::Timeout);
                    }
                    if attempt < self.cfg.max_retries {
                        attempt += 1;
                        sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                        continue;
                    }
                    return Err(LlmError::Transport(e.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(base_url: String) -> LlmConfig {
        LlmConfig {
            enabled: true,
            api_key: "test-key".to_string(),
            model: "openai/gpt-4o-mini".to_string(),
            base_url,
            timeout_secs: 5,
            max_retries: 0,
        }
    }

    fn row(index: usize, raw: &str) -> EscalationRow {
        EscalationRow {
            index,
            raw_text: raw.to_string(),
            parser_guess: ClassificationResult {
                instrument_type: InstrumentType::Unknown,
                action: TxAction::Other,
                strategy: None,
                is_closing: None,
                underlying: None,
                confidence: 0.4,
                complexity_score: None,
            },
        }
    }

    #[test]
    fn test_parse_content_strips_fences() {
        let content = "```json\n[{\"instrument_type\":\"equity\",\"action\":\"buy\",\"confidence\":0.9}]\n```";
        let parsed = OpenRouterClassifier::parse_content(content, 1).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].action, TxAction::Buy);
    }

    #[test]
    fn test_parse_content_rejects_length_mismatch() {
        let content = "[{\"instrument_type\":\"equity\",\"action\":\"buy\",\"confidence\":0.9}]";
        assert!(matches!(
            OpenRouterClassifier::parse_content(content, 2),
            Err(LlmError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_classify_batch_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "choices": [{
                "message": {
                    "content": "[{\"instrument_type\":\"options\",\"action\":\"sell\",\"strategy\":\"covered_call\",\"confidence\":0.92,\"reasoning\":\"call sale against holdings\"}]"
                }
            }]
        });
        let mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let classifier = OpenRouterClassifier::new(cfg(format!("{}/", server.url())));
        let rows = vec![row(0, "SOLD 5 AAPL CALL")];
        let results = classifier
            .classify_batch(&rows, &AccountPositionContext::default(), "wells_fargo")
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].strategy.as_deref(), Some("covered_call"));
        assert!((results[0].confidence - 0.92).abs() < 1e-9);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_error_is_batch_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let classifier = OpenRouterClassifier::new(cfg(format!("{}/", server.url())));
        let rows = vec![row(0, "SOLD 5 AAPL CALL")];
        let err = classifier
            .classify_batch(&rows, &AccountPositionContext::default(), "schwab")
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::HttpStatus { status: 500, .. }));
    }
}
