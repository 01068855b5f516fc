use crate::gateway::ModelGateway;
use crate::tools::ToolSchema;
use crate::types::{AgentError, Part, Turn};
use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::env;
use tracing::{debug, info};

#[derive(Clone)]
pub struct GeminiConfig {
    pub api_base: String, // e.g. "https://generativelanguage.googleapis.com/v1beta"
    pub api_key: String,  // env GENAI_API_KEY
    pub model: String,    // e.g. "gemini-flash-lite-latest"
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("GEMINI_BASE_URL")
                .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".into()),
            api_key: env::var("GENAI_API_KEY").unwrap_or_default(),
            model: env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-flash-lite-latest".into()),
        }
    }
}

#[derive(Clone)]
pub struct GeminiClient {
    http: Client,
    cfg: GeminiConfig,
}

impl GeminiClient {
    pub fn new(cfg: GeminiConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("GENAI_API_KEY missing");
        }
        Ok(Self { http: Client::new(), cfg })
    }

    fn encode_part(part: &Part) -> Value {
        match part {
            Part::Text(text) => json!({"text": text}),
            Part::ToolInvocation { name, args } => json!({"functionCall": {"name": name, "args": args}}),
            Part::ToolResponse { name, response } => {
                json!({"functionResponse": {"name": name, "response": response}})
            }
            Part::Image { mime_type, data } => {
                json!({"inlineData": {"mimeType": mime_type, "data": STANDARD.encode(data)}})
            }
        }
    }

    fn encode_contents(contents: &[Turn]) -> Value {
        Value::Array(
            contents
                .iter()
                .map(|turn| {
                    json!({
                        "role": turn.role.as_str(),
                        "parts": turn.parts.iter().map(Self::encode_part).collect::<Vec<_>>(),
                    })
                })
                .collect(),
        )
    }

    fn build_request(schema: &ToolSchema, contents: &[Turn]) -> Value {
        json!({
            "systemInstruction": {"parts": [{"text": schema.system_instruction()}]},
            "contents": Self::encode_contents(contents),
            "tools": [{"functionDeclarations": schema.declarations()}],
            "generationConfig": {"temperature": schema.temperature()}
        })
    }

    fn parse_output(v: &Value) -> Result<Vec<Part>, AgentError> {
        // generateContent returns { candidates: [ { content: { role, parts: [...] } } ] }
        let raw_parts = v
            .pointer("/candidates/0/content/parts")
            .and_then(|x| x.as_array())
            .cloned()
            .unwrap_or_default();

        let mut parts = Vec::with_capacity(raw_parts.len());
        for p in &raw_parts {
            if let Some(call) = p.get("functionCall") {
                let name = call
                    .get("name")
                    .and_then(|x| x.as_str())
                    .ok_or_else(|| AgentError::Gateway("functionCall without name".into()))?;
                let args = call
                    .get("args")
                    .and_then(|x| x.as_object())
                    .cloned()
                    .unwrap_or_else(Map::new);
                parts.push(Part::ToolInvocation { name: name.to_string(), args });
            } else if let Some(text) = p.get("text").and_then(|x| x.as_str()) {
                // thought parts are internal reasoning, not part of the answer
                if p.get("thought").and_then(|x| x.as_bool()).unwrap_or(false) {
                    continue;
                }
                if !text.trim().is_empty() {
                    parts.push(Part::text(text));
                }
            }
        }

        if parts.is_empty() {
            let reason = v
                .pointer("/candidates/0/finishReason")
                .or_else(|| v.pointer("/promptFeedback/blockReason"))
                .and_then(|x| x.as_str())
                .unwrap_or("unknown");
            return Err(AgentError::Gateway(format!("empty model response (reason: {reason})")));
        }
        Ok(parts)
    }
}

#[async_trait]
impl ModelGateway for GeminiClient {
    async fn generate(&self, schema: &ToolSchema, contents: &[Turn]) -> Result<Vec<Part>, AgentError> {
        let url = format!("{}/models/{}:generateContent", self.cfg.api_base, self.cfg.model);
        let req = Self::build_request(schema, contents);
        info!(model = %self.cfg.model, turns = contents.len(), "calling gemini");

        let resp = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.cfg.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| AgentError::Gateway(format!("request failed: {e}")))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| AgentError::Gateway(format!("reading body failed: {e}")))?;
        if !status.is_success() {
            return Err(AgentError::Gateway(format!("Gemini error {status}: {text}")));
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| AgentError::Gateway(format!("failed to parse Gemini response JSON: {e}")))?;
        let parts = Self::parse_output(&v)?;
        debug!(parts = parts.len(), "gemini response parsed");
        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_rejected() {
        let cfg = GeminiConfig { api_base: "http://localhost".into(), api_key: String::new(), model: "m".into() };
        assert!(GeminiClient::new(cfg).is_err());
    }

    #[test]
    fn parses_text_and_function_calls_in_order() {
        let v = json!({"candidates": [{"content": {"role": "model", "parts": [
            {"text": "Opening the retailer", "thought": true},
            {"text": "Searching two stores"},
            {"functionCall": {"name": "web_interaction", "args": {"goal": "find mice", "url": "https://a.com"}}},
            {"functionCall": {"name": "web_interaction", "args": {"goal": "find mice", "url": "https://b.com"}}}
        ]}}]});
        let parts = GeminiClient::parse_output(&v).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], Part::text("Searching two stores"));
        match &parts[2] {
            Part::ToolInvocation { name, args } => {
                assert_eq!(name, "web_interaction");
                assert_eq!(args["url"], "https://b.com");
            }
            other => panic!("unexpected part {other:?}"),
        }
    }

    #[test]
    fn empty_candidates_are_gateway_errors() {
        let v = json!({"candidates": [{"finishReason": "SAFETY"}]});
        match GeminiClient::parse_output(&v) {
            Err(AgentError::Gateway(msg)) => assert!(msg.contains("SAFETY")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn request_carries_tool_responses_and_images() {
        let contents = vec![
            Turn::user(vec![Part::text("hi"), Part::png(vec![1, 2, 3])]),
            Turn::user(vec![Part::ToolResponse { name: "web_interaction".into(), response: json!({"result": {"status": "done", "output": "ok"}}) }]),
        ];
        let req = GeminiClient::build_request(&ToolSchema::Coordinator, &contents);
        assert_eq!(req["contents"][0]["parts"][1]["inlineData"]["data"], "AQID");
        assert_eq!(req["contents"][1]["parts"][0]["functionResponse"]["response"]["result"]["status"], "done");
        assert_eq!(req["tools"][0]["functionDeclarations"][0]["name"], "web_interaction");
        assert_eq!(req["contents"][0]["role"], "user");
    }
}
