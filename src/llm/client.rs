//! LLM client for API communication

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

/// Response from LLM
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// The generated content
    pub content: String,
    /// Number of tokens used
    pub tokens_used: Option<usize>,
}

/// Anything that can turn a prompt into text
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate a completion for `prompt`
    async fn complete(&self, prompt: &str) -> Result<LlmResponse>;
}

/// Configuration for LLM client
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// API endpoint URL
    pub endpoint: String,
    /// Model name
    pub model: String,
    /// API key (optional)
    pub api_key: Option<String>,
    /// Maximum tokens for response
    pub max_tokens: usize,
    /// Temperature for generation
    pub temperature: f32,
    /// Request timeout
    pub timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            api_key: None,
            max_tokens: 2048,
            temperature: 0.3,
            timeout: Duration::from_secs(120),
        }
    }
}

/// Wire protocol spoken by the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// `POST /api/generate`
    Ollama,
    /// `POST /v1/chat/completions`
    OpenAiCompatible,
}

impl Backend {
    /// Ollama listens on 11434; anything else is treated as OpenAI-compatible
    pub fn for_endpoint(endpoint: &str) -> Self {
        if endpoint.contains(":11434") {
            Backend::Ollama
        } else {
            Backend::OpenAiCompatible
        }
    }
}

/// Every structured prompt expects bare JSON back
const SYSTEM_MESSAGE: &str =
    "You maintain the source code and operations of an autonomous assistant. Reply with JSON only.";

/// HTTP text generator for Ollama or OpenAI-compatible endpoints
pub struct LlmClient {
    config: LlmConfig,
    backend: Backend,
    http: reqwest::Client,
}

impl LlmClient {
    /// Create a new LLM client. No request is made until the first prompt.
    pub fn new(config: LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            backend: Backend::for_endpoint(&config.endpoint),
            config,
            http,
        })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// POST `body` as JSON to `path` and decode the JSON reply
    async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let url = format!("{}{}", self.config.endpoint.trim_end_matches('/'), path);

        let mut request = self.http.post(&url).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach text generator at {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("Text generator returned {} for {}: {}", status, path, detail);
        }

        response
            .json()
            .await
            .with_context(|| format!("Unexpected reply shape from {}", path))
    }

    async fn generate(&self, prompt: &str) -> Result<LlmResponse> {
        let body = GenerateBody {
            model: &self.config.model,
            system: SYSTEM_MESSAGE,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: self.config.temperature,
                num_predict: self.config.max_tokens,
            },
        };
        let reply: GenerateReply = self.post("/api/generate", &body).await?;

        Ok(LlmResponse {
            content: reply.response,
            tokens_used: reply.eval_count,
        })
    }

    async fn chat(&self, prompt: &str) -> Result<LlmResponse> {
        let body = ChatBody {
            model: &self.config.model,
            messages: [
                ChatMessageOut {
                    role: "system",
                    content: SYSTEM_MESSAGE,
                },
                ChatMessageOut {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };
        let reply: ChatReply = self.post("/v1/chat/completions", &body).await?;

        let content = reply
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| anyhow::anyhow!("Chat completion contained no choices"))?;

        Ok(LlmResponse {
            content,
            tokens_used: reply.usage.map(|u| u.total_tokens),
        })
    }
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn complete(&self, prompt: &str) -> Result<LlmResponse> {
        tracing::debug!(
            model = %self.config.model,
            backend = ?self.backend,
            prompt_len = prompt.len(),
            "Sending completion request"
        );

        let response = match self.backend {
            Backend::Ollama => self.generate(prompt).await?,
            Backend::OpenAiCompatible => self.chat(prompt).await?,
        };

        tracing::debug!(tokens = ?response.tokens_used, "Completion received");
        Ok(response)
    }
}

// ==================== Wire types ====================

#[derive(Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    system: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: usize,
}

#[derive(Deserialize)]
struct GenerateReply {
    response: String,
    #[serde(default)]
    eval_count: Option<usize>,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: [ChatMessageOut<'a>; 2],
    max_tokens: usize,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessageOut<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatReply {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageIn,
}

#[derive(Deserialize)]
struct ChatMessageIn {
    content: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    total_tokens: usize,
}

/// Scripted reply of the mock client
#[derive(Debug, Clone)]
enum MockReply {
    Text(String),
    Fail(String),
}

#[derive(Debug, Clone)]
struct MockRule {
    prompt_contains: String,
    delay: Option<Duration>,
    reply: MockReply,
}

/// Mock LLM client for testing
///
/// Rules are matched in insertion order against the prompt; the first rule
/// whose key is contained in the prompt decides the reply.
pub struct MockLlmClient {
    rules: Vec<MockRule>,
    default_response: String,
    prompts: Mutex<Vec<String>>,
}

impl MockLlmClient {
    /// Create a new mock client
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            default_response: "[]".to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Add a mock response
    pub fn add_response(&mut self, prompt_contains: &str, response: &str) {
        self.rules.push(MockRule {
            prompt_contains: prompt_contains.to_string(),
            delay: None,
            reply: MockReply::Text(response.to_string()),
        });
    }

    /// Add a response that arrives only after `delay`
    pub fn add_delayed_response(&mut self, prompt_contains: &str, response: &str, delay: Duration) {
        self.rules.push(MockRule {
            prompt_contains: prompt_contains.to_string(),
            delay: Some(delay),
            reply: MockReply::Text(response.to_string()),
        });
    }

    /// Fail with `message` after `delay`
    pub fn add_failure(&mut self, prompt_contains: &str, message: &str, delay: Duration) {
        self.rules.push(MockRule {
            prompt_contains: prompt_contains.to_string(),
            delay: Some(delay),
            reply: MockReply::Fail(message.to_string()),
        });
    }

    /// Reply used when no rule matches
    pub fn set_default_response(&mut self, response: &str) {
        self.default_response = response.to_string();
    }

    /// Every prompt received so far
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextGenerator for MockLlmClient {
    async fn complete(&self, prompt: &str) -> Result<LlmResponse> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }

        let rule = self
            .rules
            .iter()
            .find(|rule| prompt.contains(&rule.prompt_contains))
            .cloned();

        let Some(rule) = rule else {
            return Ok(LlmResponse {
                content: self.default_response.clone(),
                tokens_used: Some(50),
            });
        };

        if let Some(delay) = rule.delay {
            tokio::time::sleep(delay).await;
        }

        match rule.reply {
            MockReply::Text(content) => Ok(LlmResponse {
                content,
                tokens_used: Some(100),
            }),
            MockReply::Fail(message) => Err(anyhow::anyhow!(message)),
        }
    }
}
