//! HTTP generator backend.
//!
//! Speaks either the foundation-models completion protocol (`modelUri`,
//! `completionOptions`, `result.alternatives`) or OpenAI-compatible chat
//! completions, chosen by [`HttpProtocol`].

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::errors::GenerationError;
use crate::core::patch::Patch;
use crate::io::config::HttpProtocol;
use crate::io::generator::{ChangeGenerator, GenerationRequest, patch_from_output};
use crate::io::process::tail_chars;
use crate::io::prompt::{Prompt, PromptRenderer};

/// Connection settings for [`HttpGenerator`].
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub protocol: HttpProtocol,
    /// Scheme and host; the protocol's endpoint path is appended.
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub temperature: f32,
    /// Completion protocol only.
    pub max_tokens: u32,
    /// Optional `x-folder-id` header some gateways require.
    pub folder_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompletionRequest<'a> {
    model_uri: &'a str,
    completion_options: CompletionOptions,
    messages: [CompletionMessage<'a>; 2],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompletionOptions {
    stream: bool,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct CompletionMessage<'a> {
    role: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct CompletionResponse {
    result: CompletionResult,
}

#[derive(Deserialize)]
struct CompletionResult {
    alternatives: Vec<CompletionAlternative>,
}

#[derive(Deserialize)]
struct CompletionAlternative {
    message: CompletionReply,
}

#[derive(Deserialize)]
struct CompletionReply {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

pub struct HttpGenerator {
    client: Client,
    url: String,
    settings: HttpSettings,
    renderer: PromptRenderer,
}

impl HttpGenerator {
    pub fn new(settings: HttpSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("codeloop/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        let path = match settings.protocol {
            HttpProtocol::Completion => "foundationModels/v1/completion",
            HttpProtocol::Chat => "v1/chat/completions",
        };
        let url = format!("{}/{path}", settings.base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            url,
            settings,
            renderer: PromptRenderer::new(),
        })
    }

    fn body(&self, prompt: &Prompt) -> Result<serde_json::Value, GenerationError> {
        let settings = &self.settings;
        let body = match settings.protocol {
            HttpProtocol::Completion => serde_json::to_value(CompletionRequest {
                model_uri: &settings.model,
                completion_options: CompletionOptions {
                    stream: false,
                    temperature: settings.temperature,
                    max_tokens: settings.max_tokens,
                },
                messages: [
                    CompletionMessage {
                        role: "system",
                        text: &prompt.system,
                    },
                    CompletionMessage {
                        role: "user",
                        text: &prompt.user,
                    },
                ],
            }),
            HttpProtocol::Chat => serde_json::to_value(ChatRequest {
                model: &settings.model,
                messages: [
                    ChatMessage {
                        role: "system",
                        content: &prompt.system,
                    },
                    ChatMessage {
                        role: "user",
                        content: &prompt.user,
                    },
                ],
                temperature: settings.temperature,
            }),
        };
        body.map_err(|e| GenerationError::UpstreamUnavailable(format!("encode request: {e}")))
    }

    /// Text of the first answer, or `None` when the response carries none.
    fn answer_text(&self, text: &str) -> Result<Option<String>, serde_json::Error> {
        Ok(match self.settings.protocol {
            HttpProtocol::Completion => serde_json::from_str::<CompletionResponse>(text)?
                .result
                .alternatives
                .into_iter()
                .next()
                .and_then(|a| a.message.text),
            HttpProtocol::Chat => serde_json::from_str::<ChatResponse>(text)?
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content),
        })
    }
}

impl ChangeGenerator for HttpGenerator {
    #[instrument(skip_all, fields(iteration = request.iteration, model = %self.settings.model))]
    fn propose(&self, request: &GenerationRequest) -> Result<Patch, GenerationError> {
        let prompt = self
            .renderer
            .render(request)
            .map_err(|e| GenerationError::UpstreamUnavailable(format!("render prompt: {e:#}")))?;
        let body = self.body(&prompt)?;

        info!(url = %self.url, "requesting completion");
        let mut builder = self
            .client
            .post(&self.url)
            .timeout(request.timeout)
            .header("Authorization", format!("Api-Key {}", self.settings.api_key))
            .json(&body);
        if let Some(folder) = &self.settings.folder_id {
            builder = builder.header("x-folder-id", folder);
        }

        let resp = builder.send().map_err(|e| {
            warn!(err = %e, timeout = e.is_timeout(), "completion request failed");
            GenerationError::UpstreamUnavailable(format!("request failed: {e}"))
        })?;
        let status = resp.status();
        let text = resp
            .text()
            .map_err(|e| GenerationError::UpstreamUnavailable(format!("read response: {e}")))?;
        if !status.is_success() {
            warn!(status = status.as_u16(), "completion endpoint returned an error");
            return Err(GenerationError::UpstreamUnavailable(format!(
                "HTTP {}: {}",
                status.as_u16(),
                tail_chars(text.trim(), 2_000)
            )));
        }

        let content = self
            .answer_text(&text)
            .map_err(|e| {
                GenerationError::UpstreamUnavailable(format!("unexpected response shape: {e}"))
            })?
            .ok_or_else(|| {
                GenerationError::UpstreamUnavailable("response has no message content".to_string())
            })?;
        debug!(bytes = content.len(), "completion received");
        patch_from_output(&content)
    }
}
