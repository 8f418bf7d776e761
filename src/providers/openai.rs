use anyhow::{Context, Result, anyhow};
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

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub(crate) const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct OpenAI {
    key: String,
    model: String,
    messages: Vec<Message>,
    tools: Vec<ToolSpec>,
}

impl OpenAI {
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

    fn find_tool(&self, name: &str) -> Result<&ToolSpec> {
        self.tools
            .iter()
            .find(|tool| tool.name == name)
            .ok_or_else(|| anyhow!("tool '{}' not registered", name))
    }

    fn request_body(&self, tool: &ToolSpec) -> serde_json::Value {
        let input = self
            .messages
            .iter()
            .filter(|message| matches!(message.role, MessageRole::User))
            .map(|message| {
                let parts = message
                    .parts
                    .iter()
                    .map(|part| match part {
                        MessagePart::Text(text) => json!({"type": "input_text", "text": text}),
                        MessagePart::Image(image) => {
                            let url =
                                format!("data:{};base64,{}", image.mime, BASE64.encode(&image.bytes));
                            json!({"type": "input_image", "image_url": url, "detail": "high"})
                        }
                    })
                    .collect::<Vec<_>>();
                json!({"role": "user", "content": parts})
            })
            .collect::<Vec<_>>();

        let mut body = json!({
            "model": self.model,
            "input": input,
            "tools": [
                {
                    "type": "function",
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters
                }
            ],
            "tool_choice": {"type": "function", "name": tool.name}
        });

        let system = system_text(&self.messages);
        if !system.trim().is_empty() {
            body["instructions"] = json!(system);
        }
        body
    }
}

impl Provider for OpenAI {
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
            let tool = self.find_tool(&tool_name)?.clone();
            let body = self.request_body(&tool);
            let client = reqwest::Client::new();
            let url = format!("{}/responses", base_url());

            let backoff = Backoff::RATE_LIMIT;
            let mut attempt = 0usize;
            let mut delay = backoff.base;
            loop {
                attempt += 1;
                let response = client
                    .post(&url)
                    .bearer_auth(&self.key)
                    .json(&body)
                    .send()
                    .await
                    .with_context(|| "failed to reach OpenAI")?;

                let status = response.status();
                let retry_after = retry_after(response.headers());
                let text = response.text().await.unwrap_or_default();
                if status.is_success() {
                    return extract_tool_response(&text, &tool_name, &self.model);
                }
                if is_rate_limited(status, &text) && attempt < RATE_LIMIT_MAX_RETRIES {
                    delay = wait_with_backoff(
                        "OpenAI rate limited;",
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
                    "OpenAI API error ({}): {}",
                    status,
                    extract_openai_error(&text).unwrap_or(text)
                ));
            }
        })
    }
}

fn base_url() -> String {
    std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
}

fn extract_tool_response(
    text: &str,
    tool_name: &str,
    fallback_model: &str,
) -> Result<ProviderResponse> {
    let payload: ResponseApiResponse =
        serde_json::from_str(text).with_context(|| "failed to parse OpenAI response JSON")?;
    let arguments = payload
        .output
        .iter()
        .find_map(|item| match item {
            ResponseOutputItem::FunctionCall { name, arguments } if name == tool_name => {
                Some(arguments)
            }
            _ => None,
        })
        .ok_or_else(|| anyhow!("no tool call returned from OpenAI"))?;

    let args: serde_json::Value =
        serde_json::from_str(arguments).with_context(|| "failed to parse OpenAI tool arguments")?;
    let model = payload
        .model
        .filter(|value| !value.trim().is_empty())
        .or_else(|| Some(fallback_model.to_string()));
    let usage = payload.usage.map(|usage| ProviderUsage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.total_tokens,
    });
    Ok(ProviderResponse { args, model, usage })
}

fn extract_openai_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<OpenAIError>,
    }

    #[derive(Deserialize)]
    struct OpenAIError {
        message: Option<String>,
        #[serde(rename = "type")]
        kind: Option<String>,
        code: Option<String>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let error = parsed.error?;
    Some(format_error_parts(error.message, error.kind, error.code))
}

#[derive(Debug, Deserialize)]
struct ResponseApiResponse {
    model: Option<String>,
    #[serde(default)]
    output: Vec<ResponseOutputItem>,
    usage: Option<ResponseApiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseOutputItem {
    #[serde(rename = "function_call")]
    FunctionCall { name: String, arguments: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ResponseApiUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/openai_tool_response.json"
    ));

    #[test]
    fn extracts_detection_tool_call() {
        let response = extract_tool_response(FIXTURE, "report_detections", DEFAULT_MODEL).unwrap();
        assert_eq!(response.model.as_deref(), Some("gpt-4o-mini-2024-07-18"));
        let detections = response.args["detections"].as_array().unwrap();
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0]["label"], "KZ1");
        assert_eq!(detections[1]["type"], "beam");
        let usage = response.usage.unwrap();
        assert_eq!(usage.total_tokens, Some(1422));
    }

    #[test]
    fn other_tool_names_are_ignored() {
        let err = extract_tool_response(FIXTURE, "summarize_sheet", DEFAULT_MODEL).unwrap_err();
        assert!(err.to_string().contains("no tool call"));
    }

    #[test]
    fn image_parts_become_data_urls() {
        let tool = ToolSpec {
            name: "report_detections".to_string(),
            description: "test".to_string(),
            parameters: json!({"type": "object"}),
        };
        let provider = OpenAI::new("key")
            .append_system_input("system prompt".to_string())
            .append_user_input("look".to_string())
            .append_user_image(ImageAttachment {
                mime: "image/png".to_string(),
                bytes: vec![1, 2, 3],
            })
            .register_tool(tool.clone());
        let body = provider.request_body(&tool);
        assert_eq!(body["instructions"], "system prompt");
        assert_eq!(body["input"][0]["content"][0]["text"], "look");
        assert_eq!(
            body["input"][1]["content"][0]["image_url"],
            "data:image/png;base64,AQID"
        );
        assert_eq!(body["tool_choice"]["name"], "report_detections");
    }

    #[test]
    fn api_errors_are_summarised() {
        let body = r#"{"error":{"message":"Invalid image","type":"invalid_request_error","code":null}}"#;
        assert_eq!(
            extract_openai_error(body).unwrap(),
            "Invalid image | type: invalid_request_error"
        );
    }
}
