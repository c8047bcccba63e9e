//! Text generation client
//!
//! The worker never runs the model itself. Prompts are sent to an inference
//! service together with the fixed decoding parameters from configuration.

use chatrelay_common::config::{DecodingConfig, GenerationConfig};
use chatrelay_common::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::{debug, trace};

/// A text-completion capability: one prompt in, one continuation out.
pub trait TextGenerator: Send + Sync + 'static {
    fn generate(&self, prompt: &str) -> impl Future<Output = Result<String>> + Send;
}

/// Generation request body
#[derive(Debug, Serialize)]
pub struct GenerationRequest<'a> {
    pub inputs: &'a str,
    pub model: &'a str,
    pub tokenizer: &'a str,
    pub parameters: GenerationParameters<'a>,
}

#[derive(Debug, Serialize)]
pub struct GenerationParameters<'a> {
    #[serde(flatten)]
    pub decoding: &'a DecodingConfig,

    /// Only the continuation is wanted, not the echoed prompt
    pub return_full_text: bool,
}

#[derive(Debug, Deserialize)]
struct GeneratedText {
    generated_text: String,
}

/// Inference services answer with either a single object or a list of candidates.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GenerationResponse {
    Single(GeneratedText),
    Candidates(Vec<GeneratedText>),
}

impl GenerationResponse {
    fn into_text(self) -> Result<String> {
        match self {
            GenerationResponse::Single(output) => Ok(output.generated_text),
            GenerationResponse::Candidates(outputs) => outputs
                .into_iter()
                .next()
                .map(|output| output.generated_text)
                .ok_or_else(|| RelayError::generation("inference service returned no candidates")),
        }
    }
}

/// Generator backed by an HTTP inference endpoint
#[derive(Debug, Clone)]
pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    tokenizer: String,
    decoding: DecodingConfig,
}

impl HttpGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| RelayError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model_path().display().to_string(),
            tokenizer: config.tokenizer_path().display().to_string(),
            decoding: config.decoding.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Body posted for `prompt`
    pub fn request_body<'a>(&'a self, prompt: &'a str) -> GenerationRequest<'a> {
        GenerationRequest {
            inputs: prompt,
            model: &self.model,
            tokenizer: &self.tokenizer,
            parameters: GenerationParameters {
                decoding: &self.decoding,
                return_full_text: false,
            },
        }
    }
}

fn request_error(err: reqwest::Error) -> RelayError {
    if err.is_timeout() {
        RelayError::timeout(format!("generation request: {}", err))
    } else {
        RelayError::generation(err.to_string())
    }
}

impl TextGenerator for HttpGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        trace!(chars = prompt.len(), endpoint = %self.endpoint, "Sending generation request");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&self.request_body(prompt))
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::generation(format!(
                "inference service returned {}: {}",
                status, body
            )));
        }

        let output: GenerationResponse = response.json().await.map_err(request_error)?;
        let text = output.into_text()?;
        debug!(chars = text.len(), "Generation complete");
        Ok(text)
    }
}
