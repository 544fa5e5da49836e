use async_openai::{Client, config::OpenAIConfig, types::CreateChatCompletionRequestArgs};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error};

/// Fallback model list used when the backend cannot enumerate models.
const FALLBACK_MODELS: &[&str] = &["Undefined"];

/// Classified failure from a gateway call.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("API quota exceeded. Please try again later or check your subscription limits.")]
    QuotaExceeded,
    #[error("Model '{model}' doesn't support system prompts. Try a different model or remove the system prompt.")]
    CapabilityUnsupported { model: String },
    #[error("Connection error. Please check your internet connection and try again.")]
    ConnectionFailure,
    #[error("Malformed model response: {0}")]
    MalformedResponse(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// Optional tuning parameters for a completion call.
#[derive(Debug, Clone, Default)]
pub struct ModelParams {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
}

/// One completion call: model, prompts and optional tuning parameters.
#[derive(Debug, Clone)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub user_prompt: &'a str,
    pub system_prompt: Option<&'a str>,
    pub params: Option<&'a ModelParams>,
}

/// Abstract capability the evaluation core depends on. Which transport
/// serves it (subprocess or hosted API) is a configuration concern.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// Run a completion call and return the generated text.
    async fn complete(&self, req: CompletionRequest<'_>) -> Result<String, GatewayError>;

    /// Return an embedding vector for the given text.
    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, GatewayError>;

    /// List available model identifiers. Never fails: on error a
    /// single-element fallback list is returned instead, since this only
    /// populates UI affordances.
    async fn list_models(&self) -> Vec<String>;
}

/// Map a backend failure message onto the error taxonomy.
fn classify_error(model: &str, message: &str) -> GatewayError {
    let lower = message.to_lowercase();
    if lower.contains("quota") || lower.contains("rate limit") {
        GatewayError::QuotaExceeded
    } else if lower.contains("system prompt") || lower.contains("system_prompt") {
        GatewayError::CapabilityUnsupported {
            model: model.to_string(),
        }
    } else if ["connection", "timeout", "network"]
        .iter()
        .any(|term| lower.contains(term))
    {
        GatewayError::ConnectionFailure
    } else {
        GatewayError::Other(message.trim().to_string())
    }
}

/// Parse an embedding vector from its textual JSON encoding.
fn parse_embedding(raw: &str) -> Result<Vec<f32>, GatewayError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(GatewayError::MalformedResponse(
            "empty embedding output".to_string(),
        ));
    }
    serde_json::from_str(trimmed).map_err(|e| {
        GatewayError::MalformedResponse(format!("failed to parse embedding output: {e}"))
    })
}

/// Extract model names from `llm models` output. Each relevant line looks
/// like `Provider Chat: model-id (aliases: short)`; the id sits between the
/// first colon and the optional parenthesized aliases.
fn parse_models_output(stdout: &str) -> Vec<String> {
    let mut models = Vec::new();
    for line in stdout.lines() {
        if let Some((_, rest)) = line.split_once(':') {
            let id = match rest.split_once('(') {
                Some((before, _)) => before.trim(),
                None => rest.trim(),
            };
            if !id.is_empty() {
                models.push(id.to_string());
            }
        }
    }
    models
}

fn fallback_models() -> Vec<String> {
    FALLBACK_MODELS.iter().map(|m| m.to_string()).collect()
}

/// Gateway backed by the `llm` command-line tool.
pub struct CliGateway {
    binary: String,
}

impl CliGateway {
    pub fn new() -> Self {
        Self {
            binary: "llm".to_string(),
        }
    }

    #[cfg(test)]
    fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn completion_args(req: &CompletionRequest<'_>) -> Vec<String> {
        let mut args = vec!["-m".to_string(), req.model.to_string()];

        if let Some(params) = req.params {
            if let Some(temperature) = params.temperature {
                args.extend(["-o".to_string(), "temperature".to_string(), temperature.to_string()]);
            }
            if let Some(max_tokens) = params.max_tokens {
                args.extend(["-o".to_string(), "max_tokens".to_string(), max_tokens.to_string()]);
            }
            if let Some(top_p) = params.top_p {
                args.extend(["-o".to_string(), "top_p".to_string(), top_p.to_string()]);
            }
        }

        if let Some(system_prompt) = req.system_prompt {
            args.extend(["-s".to_string(), system_prompt.to_string()]);
        }

        args
    }
}

impl Default for CliGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmGateway for CliGateway {
    async fn complete(&self, req: CompletionRequest<'_>) -> Result<String, GatewayError> {
        let args = Self::completion_args(&req);
        debug!(model = req.model, "running completion via {} {:?}", self.binary, args);

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // The user prompt is piped on stdin rather than passed as an
        // argument, so prompt size is not limited by argv.
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(req.user_prompt.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_error(req.model, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, GatewayError> {
        debug!(model, "running embedding via {} embed", self.binary);

        let output = Command::new(&self.binary)
            .args(["embed", "-m", model, "-c", text])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GatewayError::Other(format!(
                "embedding command failed: {}",
                stderr.trim()
            )));
        }

        parse_embedding(&String::from_utf8_lossy(&output.stdout))
    }

    async fn list_models(&self) -> Vec<String> {
        let output = Command::new(&self.binary).arg("models").output().await;
        match output {
            Ok(output) if output.status.success() => {
                parse_models_output(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                error!(
                    "'{} models' failed: {}",
                    self.binary,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                fallback_models()
            }
            Err(e) => {
                error!("failed to run '{} models': {e}", self.binary);
                fallback_models()
            }
        }
    }
}

/// Gateway backed by a hosted OpenAI-compatible API.
pub struct ApiGateway {
    api_base: String,
    env_var_api_key: String,
}

impl ApiGateway {
    pub fn new(api_base: impl Into<String>, env_var_api_key: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            env_var_api_key: env_var_api_key.into(),
        }
    }

    fn client(&self) -> Result<Client<OpenAIConfig>, GatewayError> {
        let api_key = std::env::var(&self.env_var_api_key).map_err(|_| {
            GatewayError::Other(format!(
                "Environment variable {} not found",
                self.env_var_api_key
            ))
        })?;

        let openai_config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(&self.api_base);

        Ok(Client::with_config(openai_config))
    }

    fn build_request(
        req: &CompletionRequest<'_>,
    ) -> Result<async_openai::types::CreateChatCompletionRequest, GatewayError> {
        let mut messages: Vec<async_openai::types::ChatCompletionRequestMessage> = Vec::new();

        if let Some(system_prompt) = req.system_prompt {
            let system_message =
                async_openai::types::ChatCompletionRequestSystemMessageArgs::default()
                    .content(system_prompt.to_string())
                    .build()
                    .map_err(|e| GatewayError::Other(format!("Failed to build system message: {e}")))?
                    .into();
            messages.push(system_message);
        }

        let user_message = async_openai::types::ChatCompletionRequestUserMessageArgs::default()
            .content(req.user_prompt.to_string())
            .build()
            .map_err(|e| GatewayError::Other(format!("Failed to build user message: {e}")))?
            .into();
        messages.push(user_message);

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(req.model).messages(messages);

        if let Some(params) = req.params {
            if let Some(temperature) = params.temperature {
                builder.temperature(temperature as f32);
            }
            if let Some(max_tokens) = params.max_tokens {
                builder.max_tokens(max_tokens as u16);
            }
            if let Some(top_p) = params.top_p {
                builder.top_p(top_p as f32);
            }
        }

        builder
            .build()
            .map_err(|e| GatewayError::Other(format!("Failed to build completion request: {e}")))
    }
}

#[async_trait]
impl LlmGateway for ApiGateway {
    async fn complete(&self, req: CompletionRequest<'_>) -> Result<String, GatewayError> {
        debug!(model = req.model, "running completion via {}", self.api_base);

        let client = self.client()?;
        let request = Self::build_request(&req)?;

        let response = client
            .chat()
            .create(request)
            .await
            .map_err(|e| classify_error(req.model, &e.to_string()))?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default();

        Ok(content)
    }

    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, GatewayError> {
        debug!(model, "running embedding via {}", self.api_base);

        let client = self.client()?;
        let request = async_openai::types::CreateEmbeddingRequestArgs::default()
            .model(model)
            .input(text)
            .build()
            .map_err(|e| GatewayError::Other(format!("Failed to build embedding request: {e}")))?;

        let response = client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| classify_error(model, &e.to_string()))?;

        response
            .data
            .into_iter()
            .next()
            .map(|embedding| embedding.embedding)
            .ok_or_else(|| {
                GatewayError::MalformedResponse("embedding response contained no vectors".to_string())
            })
    }

    async fn list_models(&self) -> Vec<String> {
        let client = match self.client() {
            Ok(client) => client,
            Err(e) => {
                error!("cannot list models: {e}");
                return fallback_models();
            }
        };

        match client.models().list().await {
            Ok(response) => response.data.into_iter().map(|model| model.id).collect(),
            Err(e) => {
                error!("failed to list models: {e}");
                fallback_models()
            }
        }
    }
}
