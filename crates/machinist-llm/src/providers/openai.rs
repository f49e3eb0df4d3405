use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use machinist_core::config::ModelConfig;
use machinist_core::error::{MachinistError, Result};
use machinist_core::traits::LlmClient;
use machinist_core::types::ChatMessage;

use crate::streaming::{SseEvent, SseParser};

const OPENAI_API_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible client. Works with OpenAI, llama.cpp server, Ollama,
/// vLLM, Groq, OpenRouter, etc.
pub struct OpenAiClient {
    http: Client,
}

impl OpenAiClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }

    fn endpoint(config: &ModelConfig) -> String {
        let base = config.base_url.as_deref().unwrap_or(OPENAI_API_URL);
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }

    async fn send(&self, config: &ModelConfig, request: &ChatRequest) -> Result<reqwest::Response> {
        // Local servers ignore the key but the header must be present.
        let api_key = config.api_key.as_deref().unwrap_or("sk-no-key-required");

        let resp = self
            .http
            .post(Self::endpoint(config))
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| MachinistError::LlmRequest(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MachinistError::LlmRequest(format!(
                "{}: {}",
                status,
                body.chars().take(500).collect::<String>()
            )));
        }
        Ok(resp)
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize)]
struct OaiMessage {
    role: String,
    content: String,
}

fn build_request(config: &ModelConfig, messages: Vec<ChatMessage>, stream: bool) -> ChatRequest {
    ChatRequest {
        model: config.model_id.clone(),
        messages: messages
            .into_iter()
            .map(|m| OaiMessage {
                role: m.role.as_str().to_string(),
                content: m.content,
            })
            .collect(),
        max_tokens: config.max_tokens,
        temperature: Some(config.temperature),
        stream,
    }
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: StreamDeltaContent,
}

#[derive(Deserialize, Debug)]
struct StreamDeltaContent {
    #[serde(default)]
    content: Option<String>,
}

/// Extract the text fragment from one SSE event, if any.
fn parse_stream_event(event: SseEvent) -> Option<Result<String>> {
    let data = event.data.trim();
    if data == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .first()
            .and_then(|c| c.delta.content.clone())
            .filter(|s| !s.is_empty())
            .map(Ok),
        Err(e) => Some(Err(MachinistError::LlmParse(format!(
            "bad stream chunk: {}",
            e
        )))),
    }
}

impl LlmClient for OpenAiClient {
    fn complete(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<String>> {
        let config = config.clone();
        Box::pin(async move {
            let request = build_request(&config, messages, false);
            let resp = self.send(&config, &request).await?;

            let parsed: ChatResponse = resp
                .json()
                .await
                .map_err(|e| MachinistError::LlmParse(e.to_string()))?;

            parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| MachinistError::LlmParse("response carried no content".into()))
        })
    }

    fn stream_complete(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        let config = config.clone();
        Box::pin(async move {
            let request = build_request(&config, messages, true);
            let resp = self.send(&config, &request).await?;

            let fragments = resp
                .bytes_stream()
                .scan(SseParser::new(), |parser, chunk| {
                    let items: Vec<Result<String>> = match chunk {
                        Ok(bytes) => match std::str::from_utf8(&bytes) {
                            Ok(text) => parser
                                .feed(text)
                                .into_iter()
                                .filter_map(parse_stream_event)
                                .collect(),
                            Err(_) => vec![],
                        },
                        Err(e) => vec![Err(MachinistError::LlmStream(e.to_string()))],
                    };
                    futures::future::ready(Some(futures::stream::iter(items)))
                })
                .flatten();

            Ok(fragments.boxed())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(base_url: Option<&str>) -> ModelConfig {
        ModelConfig {
            provider: "openai".into(),
            model_id: "phi-3-mini-4k-instruct".into(),
            api_key: None,
            base_url: base_url.map(String::from),
            max_tokens: 256,
            temperature: 0.0,
            retry: None,
        }
    }

    #[test]
    fn test_endpoint_default() {
        let config = test_config(None);
        assert_eq!(
            OpenAiClient::endpoint(&config),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_endpoint_local_base_url() {
        let config = test_config(Some("http://localhost:8081/v1/"));
        assert_eq!(
            OpenAiClient::endpoint(&config),
            "http://localhost:8081/v1/chat/completions"
        );
    }

    #[test]
    fn test_parse_stream_event_text() {
        let event = SseEvent {
            event_type: None,
            data: r#"{"choices":[{"delta":{"content":"hel"}}]}"#.into(),
        };
        let frag = parse_stream_event(event).unwrap().unwrap();
        assert_eq!(frag, "hel");
    }

    #[test]
    fn test_parse_stream_event_done() {
        let event = SseEvent {
            event_type: None,
            data: "[DONE]".into(),
        };
        assert!(parse_stream_event(event).is_none());
    }

    #[test]
    fn test_parse_stream_event_empty_delta() {
        let event = SseEvent {
            event_type: None,
            data: r#"{"choices":[{"delta":{}}]}"#.into(),
        };
        assert!(parse_stream_event(event).is_none());
    }

    #[test]
    fn test_parse_stream_event_malformed() {
        let event = SseEvent {
            event_type: None,
            data: "not json".into(),
        };
        assert!(parse_stream_event(event).unwrap().is_err());
    }
}
