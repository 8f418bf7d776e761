use anyhow::{Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;

use super::{
    ImageAttachment, Message, MessagePart, MessageRole, Provider, ProviderFuture,
    ProviderResponse, ProviderUsage, ToolSpec, format_error_parts, system_text,
};
use crate::retry::{
    Backoff, RATE_LIMIT_MAX_RETRIES, is_rate_limited, retry_after, wait_with_backoff,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1/messages";
pub(crate) const DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";
const MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone)]
pub struct Claude {
    key: String,
    model: String,
    messages: Vec<Message>,
    tools: Vec<ToolSpec>,
}

impl Claude {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            model: DEFAULT_MODEL.to_string(),
            messages: Vec::new(),
            tools: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !model.trim().is_empty() {
            self.model = model;
        }
        self
    }

    fn find_tool(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    fn request_body(&self, tool: &ToolSpec) -> serde_json::Value {
        let messages = self
            .messages
            .iter()
            .filter(|message| matches!(message.role, MessageRole::User))
            .map(|message| {
                let content = message
                    .parts
                    .iter()
                    .map(|part| match part {
                        MessagePart::Text(text) => json!({"type": "text", "text": text}),
                        MessagePart::Image(image) => json!({
                            "type": "image",
                            "source": {
                                "type": "base64",
                                "media_type": image.mime,
                                "data": BASE64.encode(&image.bytes)
                            }
                        }),
                    })
                    .collect::<Vec<_>>();
                json!({"role": "user", "content": content})
            })
            .collect::<Vec<_>>();

        let system = system_text(&self.messages);
        let system_value = if system.trim().is_empty() {
            json!(null)
        } else {
            json!(system)
        };

        json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": messages,
            "system": system_value,
            "tools": [
                {
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.parameters
                }
            ],
            "tool_choice": {"type": "tool", "name": tool.name}
        })
    }
}

impl Provider for Claude {
    fn append_system_input(mut self, input: String) -> Self {
        self.messages.push(Message::system(input));
        self
    }

    fn append_user_input(mut self, input: String) -> Self {
        self.messages.push(Message::user(input));
        self
    }

    fn append_user_image(mut self, image: ImageAttachment) -> Self {
        self.messages.push(Message::user_image(image));
        self
    }

    fn register_tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    fn call_tool(self, tool_name: &str) -> ProviderFuture {
        let tool_name = tool_name.to_string();
        Box::pin(async move {
            let tool = self
                .find_tool(&tool_name)
                .cloned()
                .ok_or_else(|| anyhow!("tool '{}' not registered", tool_name))?;
            let body = self.request_body(&tool);
            let client = reqwest::Client::new();
            let url = base_url();

            let backoff = Backoff::RATE_LIMIT;
            let mut attempt = 0usize;
            let mut delay = backoff.base;
            loop {
                attempt += 1;
                let response = client
                    .post(&url)
                    .header("x-api-key", self.key.clone())
                    .header("anthropic-version", "2023-06-01")
                    .json(&body)
                    .send()
                    .await?;

                let status = response.status();
                let retry_after = retry_after(response.headers());
                let text = response.text().await.unwrap_or_default();
                if status.is_success() {
                    return extract_tool_response(&text, &tool_name, &self.model);
                }
                if is_rate_limited(status, &text) && attempt < RATE_LIMIT_MAX_RETRIES {
                    delay = wait_with_backoff(
                        "Claude rate limited;",
                        attempt,
                        RATE_LIMIT_MAX_RETRIES,
                        delay,
                        retry_after,
                        backoff,
                    )
                    .await;
                    continue;
                }
                return Err(anyhow!(
                    "Claude API error ({}): {}",
                    status,
                    extract_claude_error(&text).unwrap_or(text)
                ));
            }
        })
    }
}

fn base_url() -> String {
    std::env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
}

fn extract_tool_response(
    text: &str,
    tool_name: &str,
    fallback_model: &str,
) -> Result<ProviderResponse> {
    let payload: ClaudeResponse = serde_json::from_str(text)
        .map_err(|err| anyhow!("failed to parse Claude response JSON: {}", err))?;
    let block = payload
        .content
        .iter()
        .find(|block| block.kind == "tool_use" && block.name.as_deref() == Some(tool_name))
        .ok_or_else(|| anyhow!("no tool call returned from Claude"))?;
    let args = block
        .input
        .clone()
        .ok_or_else(|| anyhow!("Claude tool_use missing input"))?;

    let model = payload
        .model
        .filter(|value| !value.trim().is_empty())
        .or_else(|| Some(fallback_model.to_string()));
    let usage = payload.usage.map(|usage| ProviderUsage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage
            .input_tokens
            .zip(usage.output_tokens)
            .map(|(input, output)| input + output),
    });
    Ok(ProviderResponse { args, model, usage })
}

fn extract_claude_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<ClaudeError>,
    }

    #[derive(Deserialize)]
    struct ClaudeError {
        #[serde(rename = "type")]
        kind: Option<String>,
        message: Option<String>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let error = parsed.error?;
    Some(format_error_parts(error.message, error.kind, None))
}

#[derive(Debug, Deserialize)]
struct ClaudeResponse {
    content: Vec<ClaudeContent>,
    model: Option<String>,
    usage: Option<ClaudeUsage>,
}

#[derive(Debug, Deserialize)]
struct ClaudeUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ClaudeContent {
    #[serde(rename = "type")]
    kind: String,
    name: Option<String>,
    input: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_detection_tool_use() {
        let payload = include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/fixtures/claude_tool_response.json"
        ));
        let response = extract_tool_response(payload, "report_detections", DEFAULT_MODEL).unwrap();
        assert_eq!(response.model.as_deref(), Some("claude-3-5-sonnet-20241022"));
        let detections = response.args["detections"].as_array().unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0]["label"], "KZ1");
        assert_eq!(response.usage.unwrap().total_tokens, Some(1680));
    }

    #[test]
    fn image_blocks_are_base64_sources() {
        let tool = ToolSpec {
            name: "report_detections".to_string(),
            description: "test".to_string(),
            parameters: json!({"type": "object"}),
        };
        let provider = Claude::new("key")
            .append_user_image(ImageAttachment {
                mime: "image/png".to_string(),
                bytes: vec![1, 2, 3],
            })
            .register_tool(tool.clone());
        let body = provider.request_body(&tool);
        assert!(body["system"].is_null());
        let source = &body["messages"][0]["content"][0]["source"];
        assert_eq!(source["media_type"], "image/png");
        assert_eq!(source["data"], "AQID");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }
}
