//! Anthropic Claude decision model.
//!
//! Drives the capability loop through the Messages API tool-use protocol:
//! the catalog is sent as `tools`, every earlier step is replayed as an
//! assistant `tool_use` turn followed by a user `tool_result` turn, and the
//! `tool_use` blocks of the reply become the next step's calls. Handles
//! retry with exponential backoff and cost tracking.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use super::{DecisionModel, DecisionRequest, DecisionStep, ToolCall};
use crate::config::BrainConfig;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Maximum retries on rate limit / server errors.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (ms).
const BASE_BACKOFF_MS: u64 = 1000;

/// Approximate cost per 1K input tokens (Sonnet).
const INPUT_COST_PER_1K: f64 = 0.003;
/// Approximate cost per 1K output tokens (Sonnet).
const OUTPUT_COST_PER_1K: f64 = 0.015;

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: String,
    tools: Vec<ToolDef<'a>>,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct ToolDef<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Message {
    role: String,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct AnthropicModel {
    http: Client,
    api_key: SecretString,
    model: String,
    max_tokens: u32,
    total_cost: AtomicU64, // stored as cost * 1_000_000
    total_calls: AtomicU64,
}

impl AnthropicModel {
    pub fn new(api_key: SecretString, cfg: &BrainConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .context("Failed to build Anthropic HTTP client")?;

        Ok(Self {
            http,
            api_key,
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            total_cost: AtomicU64::new(0),
            total_calls: AtomicU64::new(0),
        })
    }

    /// Cumulative API spend in USD.
    pub fn total_cost(&self) -> f64 {
        self.total_cost.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    fn system_prompt(req: &DecisionRequest) -> String {
        format!(
            "You are the strategy brain of {name}, a {personality} {agent_type} agent competing \
             in a task-auction economy. Agents bid to perform tasks; the lowest credible bid \
             wins, every round costs living expenses, and an agent whose balance reaches zero \
             can no longer compete.\n\n\
             RULES:\n\
             1. Use the query tools to understand your situation before acting.\n\
             2. Take at most one decisive action (update_policy, propose_partnership, \
                end_partnership or record_transparency); the session ends once an action \
                succeeds.\n\
             3. update_policy requires a clear reasoning string; it is stored verbatim and \
                costs money.\n\
             4. Prefer small, reversible adjustments over drastic ones.",
            name = req.agent.name,
            personality = req.agent.personality,
            agent_type = req.agent.agent_type,
        )
    }

    fn opening_message(req: &DecisionRequest) -> String {
        let policy = serde_json::to_string_pretty(&req.policy).unwrap_or_default();
        format!(
            "ROUND: {round}\nTRIGGER: {trigger}\n\nAGENT: {agent}\n\nCURRENT POLICY:\n{policy}\n\n\
             MEMORY:\n{memory}\nDecide what to do.",
            round = req.round,
            trigger = req.trigger.describe(),
            agent = req.agent,
            memory = req.memory.render(),
        )
    }

    /// Conversation for the request: opening context, then one assistant /
    /// user turn pair per completed step.
    fn build_messages(req: &DecisionRequest) -> Vec<Message> {
        let mut messages = vec![Message {
            role: "user".to_string(),
            content: vec![ContentBlock::Text {
                text: Self::opening_message(req),
            }],
        }];
        for step in &req.transcript {
            messages.push(Message {
                role: "assistant".to_string(),
                content: step
                    .calls
                    .iter()
                    .map(|c| ContentBlock::ToolUse {
                        id: c.id.clone(),
                        name: c.name.clone(),
                        input: c.input.clone(),
                    })
                    .collect(),
            });
            messages.push(Message {
                role: "user".to_string(),
                content: step
                    .results
                    .iter()
                    .map(|r| ContentBlock::ToolResult {
                        tool_use_id: r.call_id.clone(),
                        content: r.content.to_string(),
                        is_error: !r.ok,
                    })
                    .collect(),
            });
        }
        messages
    }

    fn parse_step(body: MessagesResponse) -> DecisionStep {
        let mut step = DecisionStep::default();
        let mut notes = Vec::new();
        for block in body.content {
            match block {
                ContentBlock::ToolUse { id, name, input } => {
                    step.calls.push(ToolCall { id, name, input })
                }
                ContentBlock::Text { text } if !text.trim().is_empty() => notes.push(text),
                _ => {}
            }
        }
        if !notes.is_empty() {
            step.note = Some(notes.join("\n"));
        }
        debug!(stop_reason = ?body.stop_reason, calls = step.calls.len(), "Parsed model step");
        step
    }

    /// Send a messages request with retry + backoff.
    async fn call_api(&self, request: &MessagesRequest<'_>) -> Result<(MessagesResponse, f64)> {
        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = BASE_BACKOFF_MS * 2u64.pow(attempt - 1);
                debug!(attempt, delay_ms = delay, "Retrying Anthropic API call");
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }

            let resp = self
                .http
                .post(ANTHROPIC_API_URL)
                .header("x-api-key", self.api_key.expose_secret())
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(request)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let body: MessagesResponse =
                            response.json().await.context("Failed to parse Anthropic response")?;
                        let usage = body
                            .usage
                            .as_ref()
                            .map_or((0, 0), |u| (u.input_tokens, u.output_tokens));
                        let cost = (usage.0 as f64 / 1000.0) * INPUT_COST_PER_1K
                            + (usage.1 as f64 / 1000.0) * OUTPUT_COST_PER_1K;

                        let cost_micro = (cost * 1_000_000.0) as u64;
                        self.total_cost.fetch_add(cost_micro, Ordering::Relaxed);
                        self.total_calls.fetch_add(1, Ordering::Relaxed);

                        return Ok((body, cost));
                    }

                    // Retryable errors: 429 (rate limit), 500+, 529 (overloaded)
                    if status.as_u16() == 429 || status.as_u16() >= 500 {
                        let error_text = response.text().await.unwrap_or_default();
                        warn!(
                            status = %status,
                            attempt,
                            error = %error_text,
                            "Retryable Anthropic API error"
                        );
                        last_error = Some(format!("HTTP {status}: {error_text}"));
                        continue;
                    }

                    let error_text = response.text().await.unwrap_or_default();
                    anyhow::bail!("Anthropic API error {status}: {error_text}");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Anthropic request failed");
                    last_error = Some(format!("Request error: {e}"));
                    continue;
                }
            }
        }

        anyhow::bail!(
            "Anthropic API failed after {} retries: {}",
            MAX_RETRIES,
            last_error.unwrap_or_default()
        )
    }
}

#[async_trait]
impl DecisionModel for AnthropicModel {
    async fn decide(&self, req: &DecisionRequest) -> Result<DecisionStep> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: Self::system_prompt(req),
            tools: req
                .capabilities
                .iter()
                .map(|c| ToolDef {
                    name: c.name,
                    description: c.description,
                    input_schema: &c.input_schema,
                })
                .collect(),
            messages: Self::build_messages(req),
        };

        let (body, cost) = self
            .call_api(&request)
            .await
            .with_context(|| format!("Decision step failed for {}", req.agent.id))?;
        let step = Self::parse_step(body);

        info!(
            agent_id = %req.agent.id,
            step = req.transcript.len(),
            calls = step.calls.len(),
            cost = format!("${:.4}", cost),
            "Anthropic decision step"
        );
        Ok(step)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::{tools, StepRecord, ToolResult, Trigger};
    use crate::memory::MemoryContext;
    use crate::policy::Policy;
    use crate::types::{Agent, AgentType, Personality};
    use serde_json::json;

    fn request() -> DecisionRequest {
        DecisionRequest {
            agent: Agent::new("rev-1", "Reviewer", AgentType::Review, Personality::Aggressive),
            policy: Policy::from_personality(Personality::Aggressive),
            trigger: Trigger::Qbr {
                period_start: 1,
                period_end: 10,
            },
            round: 10,
            memory: MemoryContext::default(),
            capabilities: tools::catalog(),
            transcript: vec![],
        }
    }

    #[test]
    fn test_opening_message_has_context() {
        let req = request();
        let messages = AnthropicModel::build_messages(&req);
        assert_eq!(messages.len(), 1);
        match &messages[0].content[0] {
            ContentBlock::Text { text } => {
                assert!(text.contains("ROUND: 10"));
                assert!(text.contains("Periodic business review"));
                assert!(text.contains("target_margin"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(AnthropicModel::system_prompt(&req).contains("aggressive REVIEW"));
    }

    #[test]
    fn test_transcript_replayed_as_tool_turns() {
        let mut req = request();
        req.transcript.push(StepRecord {
            calls: vec![ToolCall {
                id: "toolu_1".into(),
                name: "get_my_stats".into(),
                input: json!({}),
            }],
            results: vec![ToolResult {
                call_id: "toolu_1".into(),
                name: "get_my_stats".into(),
                ok: false,
                content: json!({ "error": "boom" }),
            }],
        });
        let messages = AnthropicModel::build_messages(&req);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].role, "assistant");
        let wire = serde_json::to_value(&messages[2]).unwrap();
        assert_eq!(wire["content"][0]["type"], json!("tool_result"));
        assert_eq!(wire["content"][0]["tool_use_id"], json!("toolu_1"));
        assert_eq!(wire["content"][0]["is_error"], json!(true));
    }

    #[test]
    fn test_parse_tool_use_response() {
        let body: MessagesResponse = serde_json::from_value(json!({
            "content": [
                { "type": "text", "text": "Win rate is low, trimming margin." },
                { "type": "tool_use", "id": "toolu_9", "name": "update_policy",
                  "input": { "patch": { "target_margin": "0.08" }, "reasoning": "low win rate" } },
                { "type": "thinking", "thinking": "..." }
            ],
            "stop_reason": "tool_use",
            "usage": { "input_tokens": 900, "output_tokens": 120 }
        }))
        .unwrap();
        let step = AnthropicModel::parse_step(body);
        assert_eq!(step.calls.len(), 1);
        assert_eq!(step.calls[0].name, "update_policy");
        assert_eq!(step.note.as_deref(), Some("Win rate is low, trimming margin."));
    }

    #[test]
    fn test_end_turn_without_calls() {
        let body: MessagesResponse = serde_json::from_value(json!({
            "content": [{ "type": "text", "text": "Nothing to change." }],
            "stop_reason": "end_turn"
        }))
        .unwrap();
        assert!(AnthropicModel::parse_step(body).calls.is_empty());
    }

    #[test]
    fn test_tools_serialised_from_catalog() {
        let req = request();
        let request = MessagesRequest {
            model: "m",
            max_tokens: 10,
            system: String::new(),
            tools: req
                .capabilities
                .iter()
                .map(|c| ToolDef {
                    name: c.name,
                    description: c.description,
                    input_schema: &c.input_schema,
                })
                .collect(),
            messages: vec![],
        };
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["tools"].as_array().unwrap().len(), 11);
        assert_eq!(wire["tools"][0]["name"], json!("get_market_snapshot"));
    }
}
