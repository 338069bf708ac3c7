//! Cliente de la API de búsqueda generativa (Perplexity, formato chat-completions).

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::{FeedError, Result};

/// Envía un prompt y devuelve el texto crudo de la primera respuesta.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Política de reintentos con backoff exponencial y jitter completo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Intentos totales, incluido el primero.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Techo del backoff tras el intento `attempt` (1-based): `base * 2^(attempt-1)`, acotado.
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Espera aleatoria uniforme en `[0, techo]`.
    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = self.backoff_ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.gen_range(0..=ceiling))
    }
}

/// Ejecuta `op` hasta que tenga éxito, falle de forma no reintentable o se
/// agoten los intentos. `op` recibe el número de intento (1-based).
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt, &mut rand::thread_rng());
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Fallo transitorio en la API de búsqueda, reintentando"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

// --- Formato chat-completions ---

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatEnvelope {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Cliente de Perplexity sobre `reqwest`.
#[derive(Clone)]
pub struct PerplexityClient {
    http: Client,
    api_key: String,
    base_url: String,
    model: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl PerplexityClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.perplexity.ai".to_string(),
            model: model.into(),
            timeout: Duration::from_secs(180),
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(cfg.perplexity_api_key.clone(), cfg.search_model.clone())
            .with_base_url(cfg.perplexity_base_url.clone())
            .with_timeout(cfg.search_timeout)
            .with_retry(cfg.retry.clone())
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Un único intento, acotado por `timeout`. Al vencer el plazo se
    /// descarta el futuro y con él la petición en curso.
    async fn attempt(&self, prompt: &str) -> Result<String> {
        match tokio::time::timeout(self.timeout, self.send(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(FeedError::Timeout(self.timeout)),
        }
    }

    async fn send(&self, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| FeedError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FeedError::Network(e.to_string()))?;

        if !status.is_success() {
            warn!(status = %status, "Error de la API de Perplexity");
            return Err(FeedError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: ChatEnvelope = serde_json::from_str(&body)
            .map_err(|e| FeedError::malformed(format!("sobre de respuesta inválido: {e}"), &body))?;

        envelope
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| FeedError::malformed("la respuesta no contiene texto", &body))
    }
}

#[async_trait]
impl SearchClient for PerplexityClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let start = Instant::now();
        info!(model = %self.model, prompt_len = prompt.len(), "Llamando a la API de Perplexity");

        let content = with_retry(&self.retry, move |attempt| {
            debug!(attempt, "Intento de llamada a Perplexity");
            self.attempt(prompt)
        })
        .await?;

        info!(
            model = %self.model,
            duration_ms = start.elapsed().as_millis() as u64,
            response_len = content.len(),
            "Respuesta recibida de Perplexity"
        );
        debug!(raw = %content, "Respuesta cruda del modelo");
        Ok(content)
    }
}
