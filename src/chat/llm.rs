use anyhow::Context;
use async_trait::async_trait;
use bytes::BytesMut;
use futures::{stream::BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{config::LlmConfig, error::AppError};

/// Lazy, finite, non-restartable sequence of completion fragments.
pub type FragmentStream = BoxStream<'static, Result<String, AppError>>;

#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Opens one streaming completion for a single user prompt.
    async fn stream(&self, prompt: &str) -> Result<FragmentStream, AppError>;
}

// ── Wire types (OpenAI chat-completions, streaming) ──────────────────────────

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<ChoiceChunk>,
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ChoiceChunk {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiErrorBody,
}

// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum Payload {
    Fragment(String),
    Done,
    Skip,
}

fn parse_payload(data: &str) -> Result<Payload, AppError> {
    if data.trim() == "[DONE]" {
        return Ok(Payload::Done);
    }
    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|e| AppError::Upstream(format!("malformed stream chunk: {e}")))?;
    if let Some(err) = chunk.error {
        return Err(AppError::Upstream(err.message));
    }
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .map_or(Payload::Skip, Payload::Fragment))
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(env) => env.error.message,
        Err(_) => body.trim().to_string(),
    }
}

/// Incremental decoder for an upstream `text/event-stream` body.
///
/// Network chunks may split lines (and UTF-8 sequences) anywhere, so bytes are
/// buffered until a full line is available. Only `data` fields are kept; one
/// event is emitted per blank-line terminator.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: BytesMut,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw = self.buf.split_to(pos + 1);
            let text = String::from_utf8_lossy(&raw[..pos]).into_owned();
            let line = text.strip_suffix('\r').unwrap_or(text.as_str());

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
                continue;
            }
            if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
        }
        events
    }
}

#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    config: LlmConfig,
}

impl OpenAiClient {
    pub fn new(config: LlmConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .build()
            .context("build upstream http client")?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn stream(&self, prompt: &str) -> Result<FragmentStream, AppError> {
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.config.temperature,
            stream: true,
        };
        debug!(model = %self.config.model, prompt_len = prompt.len(), "opening completion stream");

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("completion request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "completion api rejected request");
            return Err(AppError::Upstream(format!(
                "completion api error {status}: {}",
                error_message(&body)
            )));
        }

        let mut bytes = response.bytes_stream();
        let fragments = async_stream::try_stream! {
            let mut decoder = SseDecoder::default();
            'read: while let Some(chunk) = bytes.next().await {
                let chunk = chunk
                    .map_err(|e| AppError::Upstream(format!("stream read error: {e}")))?;
                for data in decoder.push(&chunk) {
                    match parse_payload(&data)? {
                        Payload::Fragment(text) => yield text,
                        Payload::Done => break 'read,
                        Payload::Skip => {}
                    }
                }
            }
        };
        Ok(fragments.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::header, response::IntoResponse, routing::post, Router};

    #[test]
    fn decoder_handles_split_lines_and_crlf() {
        let mut d = SseDecoder::default();
        assert!(d.push(b"data: {\"a\"").is_empty());
        assert!(d.push(b":1}\r\n").is_empty());
        assert_eq!(d.push(b"\r\ndata: [DONE]\n\n"), vec!["{\"a\":1}", "[DONE]"]);
    }

    #[test]
    fn decoder_handles_split_utf8() {
        let mut d = SseDecoder::default();
        let bytes = "data: héllo\n\n".as_bytes();
        // split inside the two-byte 'é'
        let split = 8;
        assert!(d.push(&bytes[..split]).is_empty());
        assert_eq!(d.push(&bytes[split..]), vec!["héllo"]);
    }

    #[test]
    fn decoder_ignores_comments_and_other_fields() {
        let mut d = SseDecoder::default();
        let out = d.push(b": keep-alive\n\nevent: message\nid: 3\ndata: x\n\n");
        assert_eq!(out, vec!["x"]);
    }

    #[test]
    fn decoder_joins_multiline_data() {
        let mut d = SseDecoder::default();
        assert_eq!(d.push(b"data: a\ndata: b\n\n"), vec!["a\nb"]);
    }

    #[test]
    fn payload_parsing() {
        assert_eq!(
            parse_payload(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#).unwrap(),
            Payload::Fragment("Hi".into())
        );
        assert_eq!(
            parse_payload(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            Payload::Skip
        );
        assert_eq!(parse_payload(r#"{"choices":[]}"#).unwrap(), Payload::Skip);
        assert_eq!(parse_payload("[DONE]").unwrap(), Payload::Done);
        assert!(matches!(
            parse_payload(r#"{"error":{"message":"overloaded"}}"#),
            Err(AppError::Upstream(m)) if m == "overloaded"
        ));
        assert!(matches!(parse_payload("not json"), Err(AppError::Upstream(_))));
    }

    #[test]
    fn error_message_prefers_api_envelope() {
        assert_eq!(
            error_message(r#"{"error":{"message":"bad key","type":"auth"}}"#),
            "bad key"
        );
        assert_eq!(error_message(" gateway down \n"), "gateway down");
    }

    async fn spawn_upstream(status: u16, body: &'static str) -> String {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move || async move {
                (
                    axum::http::StatusCode::from_u16(status).unwrap(),
                    [(header::CONTENT_TYPE, "text/event-stream")],
                    body,
                )
                    .into_response()
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    fn client(base_url: String) -> OpenAiClient {
        OpenAiClient::new(LlmConfig {
            api_key: "test-key".into(),
            base_url,
            model: "gpt-3.5-turbo".into(),
            temperature: 0.7,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn streams_fragments_until_done() {
        let base = spawn_upstream(
            200,
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
             data: [DONE]\n\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        )
        .await;
        let stream = client(base).stream("hi").await.unwrap();
        let out: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(out, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn in_band_error_ends_stream() {
        let base = spawn_upstream(
            200,
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n\
             data: {\"error\":{\"message\":\"overloaded\"}}\n\n",
        )
        .await;
        let out: Vec<Result<String, AppError>> =
            client(base).stream("hi").await.unwrap().collect().await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap(), "a");
        assert!(matches!(&out[1], Err(AppError::Upstream(m)) if m == "overloaded"));
    }

    #[tokio::test]
    async fn non_success_status_fails_to_open() {
        let base = spawn_upstream(401, r#"{"error":{"message":"Incorrect API key"}}"#).await;
        match client(base).stream("hi").await {
            Err(AppError::Upstream(m)) => assert!(m.contains("Incorrect API key")),
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("expected failure"),
        }
    }
}
