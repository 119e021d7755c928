//! Advisor service
//!
//! LLM seam used for two advisory tasks: generalizing a human correction
//! into a candidate classification rule, and writing the plain-language
//! deal narrative. Advisory output never bypasses arithmetic verification;
//! a failed narrative call degrades the deal, it does not block it.

use crate::error::UnderwritingError;
use crate::models::TrainingExample;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{error, info};

/// A candidate rule distilled from one correction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleProposal {
    /// Merchant signature fragment the rule should match on.
    pub pattern: String,
    pub rule_type: String,
    pub correct_classification: String,
    pub rationale: String,
}

#[async_trait]
pub trait AdvisorService: Send + Sync {
    /// Generalize a correction into a reusable rule, given up to three
    /// prior corrections on the same field as few-shot context.
    async fn propose_rule(
        &self,
        field: &str,
        original_value: &str,
        corrected_value: &str,
        examples: &[TrainingExample],
    ) -> Result<RuleProposal>;

    /// Plain-language summary of a completed analysis.
    async fn narrative_summary(&self, analysis: &serde_json::Value) -> Result<String>;
}

/// Pull the body of a ```json ... ``` fence out of a model response.
pub fn extract_json_fence(text: &str) -> Option<&str> {
    let start = text.find("```json")?;
    let after_fence = &text[start + 7..];
    let end = after_fence.find("```")?;
    Some(after_fence[..end].trim())
}

//
// ================= HTTP Implementation =================
//

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// Chat-completions client (connection-pooled).
pub struct HttpAdvisor {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpAdvisor {
    pub fn new(base_url: String, api_key: String, model: String) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url,
            api_key,
            model,
        }
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(UnderwritingError::AdvisorError(
                "ADVISOR_API_KEY not configured".to_string(),
            ));
        }

        let url = format!("{}/v1/chat/completions", self.base_url);
        let request = json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });

        info!("Calling advisor API");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Advisor request failed: {}", e);
                UnderwritingError::AdvisorError(format!("advisor request: {}", e))
            })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Advisor API error response: {}", error_text);
            return Err(UnderwritingError::AdvisorError(format!(
                "advisor response: {}",
                error_text
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| UnderwritingError::AdvisorError(format!("advisor parse: {}", e)))?;

        chat.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| UnderwritingError::AdvisorError("empty advisor response".to_string()))
    }
}

const RULE_SYSTEM_PROMPT: &str = r#"You generalize underwriting corrections into reusable rules.

Given an original machine value, the human-corrected value, and prior
corrections for the same field, produce ONE rule that would prevent the
mistake in the future. Respond with exactly one fenced block:

```json
{
  "pattern": "<uppercase merchant signature fragment>",
  "rule_type": "<field being corrected>",
  "correct_classification": "<the corrected value>",
  "rationale": "<one sentence>"
}
```"#;

const NARRATIVE_SYSTEM_PROMPT: &str = r#"You are an underwriting analyst. Summarize the deal analysis in
three to five plain-language sentences for a human reviewer. State the
revenue picture, existing advance positions, and the computed
recommendation with its driving ratio. Do not invent numbers."#;

#[async_trait]
impl AdvisorService for HttpAdvisor {
    async fn propose_rule(
        &self,
        field: &str,
        original_value: &str,
        corrected_value: &str,
        examples: &[TrainingExample],
    ) -> Result<RuleProposal> {
        let mut user = format!(
            "Field: {}\nOriginal value: {}\nCorrected value: {}\n",
            field, original_value, corrected_value
        );
        if !examples.is_empty() {
            user.push_str("\nPrior corrections for this field:\n");
            for example in examples.iter().take(3) {
                user.push_str(&format!(
                    "- '{}' was corrected to '{}'\n",
                    example.original_value, example.corrected_value
                ));
            }
        }

        let content = self.complete(RULE_SYSTEM_PROMPT, &user).await?;
        let fenced = extract_json_fence(&content).ok_or_else(|| {
            UnderwritingError::AdvisorError("rule proposal carried no JSON fence".to_string())
        })?;
        let proposal: RuleProposal = serde_json::from_str(fenced)
            .map_err(|e| UnderwritingError::AdvisorError(format!("rule proposal parse: {}", e)))?;

        if proposal.pattern.trim().is_empty() {
            return Err(UnderwritingError::AdvisorError(
                "rule proposal had an empty pattern".to_string(),
            ));
        }
        Ok(proposal)
    }

    async fn narrative_summary(&self, analysis: &serde_json::Value) -> Result<String> {
        let user = serde_json::to_string_pretty(analysis)?;
        self.complete(NARRATIVE_SYSTEM_PROMPT, &user).await
    }
}

//
// ================= Mock Implementation =================
//

/// Offline advisor for tests and local runs without an API key.
pub struct MockAdvisor;

#[async_trait]
impl AdvisorService for MockAdvisor {
    async fn propose_rule(
        &self,
        field: &str,
        original_value: &str,
        corrected_value: &str,
        _examples: &[TrainingExample],
    ) -> Result<RuleProposal> {
        Ok(RuleProposal {
            pattern: corrected_value.to_uppercase(),
            rule_type: field.to_string(),
            correct_classification: corrected_value.to_string(),
            rationale: format!("human corrected '{}' to '{}'", original_value, corrected_value),
        })
    }

    async fn narrative_summary(&self, analysis: &serde_json::Value) -> Result<String> {
        let recommendation = analysis
            .get("recommendation")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        Ok(format!(
            "Automated analysis complete; recommendation: {}.",
            recommendation
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_extraction_ignores_surrounding_prose() {
        let text = "Here is the rule you asked for:\n```json\n{\"pattern\": \"XYZ\"}\n```\nHope that helps.";
        assert_eq!(extract_json_fence(text), Some("{\"pattern\": \"XYZ\"}"));
    }

    #[test]
    fn unfenced_text_yields_nothing() {
        assert!(extract_json_fence("{\"pattern\": \"XYZ\"}").is_none());
        assert!(extract_json_fence("```json no closing fence").is_none());
    }

    #[test]
    fn proposal_round_trips_from_fenced_json() {
        let fenced = extract_json_fence(
            "```json\n{\"pattern\": \"XYZ CAPITAL\", \"rule_type\": \"position_classification\", \"correct_classification\": \"Not MCA\", \"rationale\": \"internal transfer\"}\n```",
        )
        .unwrap();
        let proposal: RuleProposal = serde_json::from_str(fenced).unwrap();
        assert_eq!(proposal.pattern, "XYZ CAPITAL");
        assert_eq!(proposal.correct_classification, "Not MCA");
    }

    #[tokio::test]
    async fn mock_advisor_generalizes_corrections() {
        let proposal = MockAdvisor
            .propose_rule("vendor_category", "MCA Lender", "Payroll", &[])
            .await
            .unwrap();
        assert_eq!(proposal.pattern, "PAYROLL");
        assert_eq!(proposal.rule_type, "vendor_category");
    }
}
