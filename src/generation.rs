use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::config::GenerationConfig;
use crate::error::{GenerationError, GenerationFailure};

const REVIEWER_SYSTEM_PROMPT: &str = "You are an expert code reviewer. Report concrete, actionable \
problems with the line they occur on. Do not rewrite the code.";

const CODER_SYSTEM_PROMPT: &str = "You are an expert software engineer. Apply review feedback \
precisely and return only the complete updated file content.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationRole {
    Analyze,
    Fix,
}

impl fmt::Display for GenerationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationRole::Analyze => f.write_str("analyze"),
            GenerationRole::Fix => f.write_str("fix"),
        }
    }
}

/// Maps a prompt to free text. Implementations do not retry.
pub trait GenerationService: Send + Sync {
    fn generate(
        &self,
        prompt: &str,
        role: GenerationRole,
    ) -> impl Future<Output = Result<String, GenerationError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Any server speaking the OpenAI chat completions API.
    OpenAi,
    Ollama,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Ollama => "ollama",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com",
            Provider::Ollama => "http://localhost:11434",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4o",
            Provider::Ollama => "llama3",
        }
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Provider::OpenAi),
            "ollama" => Ok(Provider::Ollama),
            other => Err(format!("unknown provider: {other} (expected: openai, ollama)")),
        }
    }
}

/// Generation over HTTP using blocking `ureq` calls on the blocking pool.
#[derive(Clone)]
pub struct HttpGenerationService {
    provider: Provider,
    base_url: String,
    model: String,
    fix_model: Option<String>,
    api_key: Option<String>,
    agent: ureq::Agent,
}

impl HttpGenerationService {
    pub fn new(config: &GenerationConfig, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            provider: config.provider,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            fix_model: config.fix_model.clone(),
            api_key,
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    /// Reads the API key from the configured environment variable, if set.
    pub fn from_config(config: &GenerationConfig, timeout: Duration) -> Self {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        Self::new(config, api_key, timeout)
    }

    fn model_for(&self, role: GenerationRole) -> &str {
        match role {
            GenerationRole::Fix => self.fix_model.as_deref().unwrap_or(&self.model),
            GenerationRole::Analyze => &self.model,
        }
    }

    fn request(&self, prompt: &str, role: GenerationRole) -> (String, Value) {
        let system = match role {
            GenerationRole::Analyze => REVIEWER_SYSTEM_PROMPT,
            GenerationRole::Fix => CODER_SYSTEM_PROMPT,
        };
        let model = self.model_for(role);
        match self.provider {
            Provider::OpenAi => (
                format!("{}/v1/chat/completions", self.base_url),
                json!({
                    "model": model,
                    "messages": [
                        {"role": "system", "content": system},
                        {"role": "user", "content": prompt},
                    ],
                    "temperature": 0.2,
                }),
            ),
            Provider::Ollama => (
                format!("{}/api/generate", self.base_url),
                json!({
                    "model": model,
                    "system": system,
                    "prompt": prompt,
                    "stream": false,
                    "options": {"temperature": 0.2},
                }),
            ),
        }
    }

    fn generate_blocking(&self, url: &str, body: &Value) -> Result<String, GenerationError> {
        let mut request = self.agent.post(url).set("Content-Type", "application/json");
        if let Some(ref key) = self.api_key {
            request = request.set("Authorization", &format!("Bearer {key}"));
        }
        let response = request.send_json(body).map_err(classify)?;
        let json: Value = response.into_json().map_err(|e| {
            GenerationError::new(
                GenerationFailure::Malformed,
                format!("response is not JSON: {e}"),
            )
        })?;
        parse_response(self.provider, &json)
    }
}

impl GenerationService for HttpGenerationService {
    async fn generate(&self, prompt: &str, role: GenerationRole) -> Result<String, GenerationError> {
        let (url, body) = self.request(prompt, role);
        debug!(provider = self.provider.as_str(), model = self.model_for(role), %role, "generation request");
        let service = self.clone();
        tokio::task::spawn_blocking(move || service.generate_blocking(&url, &body))
            .await
            .map_err(|e| {
                GenerationError::new(
                    GenerationFailure::Unavailable,
                    format!("generation task failed: {e}"),
                )
            })?
    }
}

/// Pulls the generated text out of a provider response.
pub fn parse_response(provider: Provider, json: &Value) -> Result<String, GenerationError> {
    let text = match provider {
        Provider::OpenAi => json
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str),
        Provider::Ollama => json.get("response").and_then(Value::as_str),
    };
    match text {
        Some(t) if !t.trim().is_empty() => Ok(t.to_string()),
        Some(_) => Err(GenerationError::new(
            GenerationFailure::Malformed,
            "response contained empty text",
        )),
        None => Err(GenerationError::new(
            GenerationFailure::Malformed,
            format!("{} response missing generated text", provider.as_str()),
        )),
    }
}

pub fn failure_for_status(code: u16) -> GenerationFailure {
    match code {
        429 => GenerationFailure::RateLimited,
        408 | 504 => GenerationFailure::Timeout,
        _ => GenerationFailure::Unavailable,
    }
}

fn classify(err: ureq::Error) -> GenerationError {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            GenerationError::new(failure_for_status(code), format!("HTTP {code}: {body}"))
        }
        ureq::Error::Transport(t) => {
            let message = t.to_string();
            let reason = if message.contains("timed out") {
                GenerationFailure::Timeout
            } else {
                GenerationFailure::Unavailable
            };
            GenerationError::new(reason, message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(provider: Provider, fix_model: Option<&str>) -> HttpGenerationService {
        let config = GenerationConfig {
            provider,
            base_url: "http://llm.local/".to_string(),
            model: "reviewer".to_string(),
            fix_model: fix_model.map(str::to_string),
            api_key_env: "UNUSED".to_string(),
        };
        HttpGenerationService::new(&config, None, Duration::from_secs(5))
    }

    #[test]
    fn test_openai_request_shape() {
        let svc = service(Provider::OpenAi, Some("coder"));
        let (url, body) = svc.request("review this", GenerationRole::Fix);
        assert_eq!(url, "http://llm.local/v1/chat/completions");
        assert_eq!(body["model"], "coder");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "review this");
    }

    #[test]
    fn test_ollama_request_shape() {
        let svc = service(Provider::Ollama, None);
        let (url, body) = svc.request("fix this", GenerationRole::Fix);
        assert_eq!(url, "http://llm.local/api/generate");
        assert_eq!(body["model"], "reviewer");
        assert_eq!(body["stream"], false);
        assert_eq!(body["prompt"], "fix this");
    }

    #[test]
    fn test_parse_openai_response() {
        let json = json!({"choices": [{"message": {"role": "assistant", "content": "LGTM"}}]});
        assert_eq!(parse_response(Provider::OpenAi, &json).unwrap(), "LGTM");
    }

    #[test]
    fn test_parse_ollama_response() {
        let json = json!({"model": "llama3", "response": "- line 3: typo", "done": true});
        assert_eq!(
            parse_response(Provider::Ollama, &json).unwrap(),
            "- line 3: typo"
        );
    }

    #[test]
    fn test_parse_missing_or_empty_text_is_malformed() {
        let err = parse_response(Provider::OpenAi, &json!({"choices": []})).unwrap_err();
        assert_eq!(err.reason, GenerationFailure::Malformed);
        let err = parse_response(Provider::Ollama, &json!({"response": "  "})).unwrap_err();
        assert_eq!(err.reason, GenerationFailure::Malformed);
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(failure_for_status(429), GenerationFailure::RateLimited);
        assert_eq!(failure_for_status(504), GenerationFailure::Timeout);
        assert_eq!(failure_for_status(500), GenerationFailure::Unavailable);
        assert_eq!(failure_for_status(401), GenerationFailure::Unavailable);
    }

    #[test]
    fn test_provider_from_str() {
        assert_eq!("ollama".parse::<Provider>().unwrap(), Provider::Ollama);
        assert!("anthropic".parse::<Provider>().is_err());
    }
}
