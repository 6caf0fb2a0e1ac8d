use chrono::{DateTime, NaiveDateTime, Utc};
use pilot_core::{LlmConfig, Message, Role, TokenUsage, ToolCall, ToolDefinition};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use serde_json::{Value, json};
use std::error::Error as StdError;
use std::thread;
use std::time::Duration;

/// Base delay for transport error retries (1s, 2s, 4s exponential backoff).
const NETWORK_RETRY_BASE_MS: u64 = 1000;
const MAX_RETRIES: u8 = 3;
const REQUEST_TIMEOUT_SECS: u64 = 300;

/// Transport failures, provider-reported failures and empty completions are
/// deliberately distinct variants so callers can react differently.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("api error (HTTP {status}): {message}")]
    Api { status: u16, message: String },
    #[error("model returned an empty completion")]
    Empty,
    #[error("{0} not set in the environment")]
    MissingApiKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    None,
    Required,
}

impl ToolChoice {
    fn as_value(self) -> Value {
        match self {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::None => json!("none"),
            ToolChoice::Required => json!("required"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
    pub max_tokens: u32,
    pub temperature: f64,
}

#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
    pub usage: TokenUsage,
}

pub trait LlmClient: Send + Sync {
    fn complete_chat(&self, req: &ChatRequest) -> Result<LlmResponse, LlmError>;
}

/// Blocking client for an OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct HttpLlmClient {
    cfg: LlmConfig,
    client: Client,
}

impl HttpLlmClient {
    pub fn new(cfg: LlmConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        Ok(Self { cfg, client })
    }

    fn resolve_api_key(&self) -> Result<String, LlmError> {
        std::env::var(&self.cfg.api_key_env)
            .map_err(|_| LlmError::MissingApiKey(self.cfg.api_key_env.clone()))
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.cfg.base_url.trim_end_matches('/')
        )
    }

    fn build_payload(&self, req: &ChatRequest) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(message_payload).collect();
        let mut payload = json!({
            "model": self.cfg.model,
            "messages": messages,
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
            "stream": false,
        });
        if !req.tools.is_empty() {
            payload["tools"] = json!(req.tools);
            payload["tool_choice"] = req.tool_choice.as_value();
        }
        payload
    }
}

impl LlmClient for HttpLlmClient {
    fn complete_chat(&self, req: &ChatRequest) -> Result<LlmResponse, LlmError> {
        let api_key = self.resolve_api_key()?;
        let payload = self.build_payload(req);

        let mut last_err = LlmError::Transport("request not attempted".to_string());
        let mut attempt: u8 = 0;
        while attempt <= MAX_RETRIES {
            let response = self
                .client
                .post(self.endpoint())
                .bearer_auth(&api_key)
                .json(&payload)
                .send();

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));
                    let body = resp
                        .text()
                        .map_err(|e| LlmError::Transport(e.to_string()))?;
                    if status.is_success() {
                        return parse_response(&body);
                    }
                    last_err = api_error(status, &body);
                    if should_retry_status(status) && attempt < MAX_RETRIES {
                        thread::sleep(retry_delay(NETWORK_RETRY_BASE_MS, attempt, retry_after));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_err = LlmError::Transport(describe_transport_error(&e));
                    if should_retry_transport_error(&e) && attempt < MAX_RETRIES {
                        thread::sleep(retry_delay(NETWORK_RETRY_BASE_MS, attempt, None));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
            }
        }
        Err(last_err)
    }
}

fn message_payload(message: &Message) -> Value {
    match message.role {
        Role::System => json!({"role": "system", "content": message.content}),
        Role::User => json!({"role": "user", "content": message.content}),
        Role::Assistant => {
            let mut msg = json!({"role": "assistant", "content": message.content});
            if !message.tool_calls.is_empty() {
                let calls: Vec<Value> = message
                    .tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                // The wire format carries arguments as a JSON string.
                                "arguments": call.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                msg["tool_calls"] = json!(calls);
            }
            msg
        }
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id.as_deref().unwrap_or_default(),
            "content": message.content,
        }),
    }
}

fn parse_response(body: &str) -> Result<LlmResponse, LlmError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| LlmError::Transport(format!("bad payload: {e}")))?;
    let Some(choice) = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|arr| arr.first())
    else {
        return Err(LlmError::Empty);
    };
    let message = choice.get("message").cloned().unwrap_or_else(|| json!({}));
    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| calls.iter().filter_map(parse_tool_call).collect())
        .unwrap_or_default();
    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .unwrap_or("stop")
        .to_string();
    let usage = value
        .get("usage")
        .map(|u| TokenUsage {
            prompt_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
            completion_tokens: u
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        })
        .unwrap_or_default();

    let response = LlmResponse {
        content,
        tool_calls,
        finish_reason,
        usage,
    };
    if response.content.is_empty() && response.tool_calls.is_empty() {
        return Err(LlmError::Empty);
    }
    Ok(response)
}

fn parse_tool_call(value: &Value) -> Option<ToolCall> {
    let function = value.get("function")?;
    let name = function.get("name")?.as_str()?.to_string();
    let raw_args = function
        .get("arguments")
        .and_then(Value::as_str)
        .unwrap_or("{}");
    let arguments = serde_json::from_str(raw_args).unwrap_or_else(|_| json!({"raw": raw_args}));
    Some(ToolCall {
        id: value
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        name,
        arguments,
    })
}

fn api_error(status: StatusCode, body: &str) -> LlmError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(ToString::to_string))
        })
        .unwrap_or_else(|| body.chars().take(200).collect());
    LlmError::Api {
        status: status.as_u16(),
        message,
    }
}

fn describe_transport_error(err: &reqwest::Error) -> String {
    let inner = err
        .source()
        .map(|e| e.to_string())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let is_dns = inner.contains("dns")
        || inner.contains("resolve")
        || inner.contains("no such host")
        || inner.contains("getaddrinfo");

    if err.is_timeout() {
        "request timed out waiting for the completions endpoint".to_string()
    } else if is_dns {
        "dns resolution failed for the completions endpoint".to_string()
    } else if err.is_connect() {
        "connection refused by the completions endpoint".to_string()
    } else {
        format!("network error: {err}")
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::SERVICE_UNAVAILABLE
    )
}

fn should_retry_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn parse_retry_after_seconds(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = header?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    let retry_at = DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
                .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        })
        .ok()?;
    Some(
        retry_at
            .signed_duration_since(Utc::now())
            .num_seconds()
            .max(0) as u64,
    )
}

fn retry_delay(base_ms: u64, attempt: u8, retry_after_seconds: Option<u64>) -> Duration {
    if let Some(seconds) = retry_after_seconds {
        return Duration::from_millis(seconds.saturating_mul(1000));
    }
    let exponential = base_ms.saturating_mul(2_u64.saturating_pow(u32::from(attempt)));
    Duration::from_millis(exponential.max(base_ms.max(100)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_core::Message;

    #[test]
    fn payload_maps_roles_and_stringifies_tool_arguments() {
        let client = HttpLlmClient::new(LlmConfig::default()).unwrap();
        let call = ToolCall {
            id: "call_1".to_string(),
            name: "fs.read".to_string(),
            arguments: json!({"path": "src/lib.rs"}),
        };
        let req = ChatRequest {
            messages: vec![
                Message::system("sys"),
                Message::user("hi"),
                Message::assistant_with_tools("", vec![call.clone()]),
                Message::tool(call.id, "contents"),
            ],
            tools: vec![ToolDefinition::function("fs.read", "read a file", json!({}))],
            tool_choice: ToolChoice::Auto,
            max_tokens: 100,
            temperature: 0.0,
        };
        let payload = client.build_payload(&req);
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[3]["tool_call_id"], "call_1");
        let args = messages[2]["tool_calls"][0]["function"]["arguments"]
            .as_str()
            .unwrap();
        assert!(args.contains("src/lib.rs"));
        assert_eq!(payload["tool_choice"], "auto");
    }

    #[test]
    fn parses_tool_call_responses() {
        let body = r#"{
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "content": "",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "fs.list", "arguments": "{\"path\": \".\"}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        }"#;
        let response = parse_response(body).unwrap();
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "fs.list");
        assert_eq!(response.tool_calls[0].arguments["path"], ".");
        assert_eq!(response.usage.prompt_tokens, 10);
        assert_eq!(response.finish_reason, "tool_calls");
    }

    #[test]
    fn empty_completion_is_a_distinct_error() {
        let body = r#"{"choices": [{"message": {"content": ""}}]}"#;
        assert!(matches!(parse_response(body), Err(LlmError::Empty)));
        assert!(matches!(parse_response("{}"), Err(LlmError::Empty)));
    }

    #[test]
    fn api_errors_carry_status_and_provider_message() {
        let err = api_error(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"error": {"message": "slow down"}}"#,
        );
        match err {
            LlmError::Api { status, message } => {
                assert_eq!(status, 429);
                assert_eq!(message, "slow down");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn retry_delay_backs_off_exponentially_unless_instructed() {
        assert_eq!(retry_delay(1000, 0, None), Duration::from_millis(1000));
        assert_eq!(retry_delay(1000, 1, None), Duration::from_millis(2000));
        assert_eq!(retry_delay(1000, 2, None), Duration::from_millis(4000));
        assert_eq!(retry_delay(1000, 2, Some(7)), Duration::from_millis(7000));
    }

    #[test]
    fn retry_after_header_accepts_seconds_and_http_dates() {
        let seconds = reqwest::header::HeaderValue::from_static("12");
        assert_eq!(parse_retry_after_seconds(Some(&seconds)), Some(12));
        let past = reqwest::header::HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(parse_retry_after_seconds(Some(&past)), Some(0));
        assert_eq!(parse_retry_after_seconds(None), None);
    }
}
