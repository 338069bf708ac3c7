//! Taxonomía de errores del pipeline y su traducción a respuestas HTTP.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Caracteres de la respuesta cruda que se conservan para diagnóstico.
pub const EXCERPT_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Autorización inválida: {0}")]
    Auth(String),

    #[error("Perfil de usuario no encontrado. Genera el perfil antes de solicitar el feed.")]
    ProfileMissing,

    #[error("Faltan datos de entrada: {0}")]
    MissingInput(String),

    #[error("Petición inválida: {0}")]
    Validation(String),

    #[error("Error de la API de búsqueda ({status})")]
    Upstream { status: u16, body: String },

    #[error("La API de búsqueda no respondió en {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Error de red llamando a la API de búsqueda: {0}")]
    Network(String),

    #[error("Respuesta JSON inválida del modelo: {reason}")]
    MalformedResponse { reason: String, excerpt: String },

    #[error("Error de persistencia: {0}")]
    Persistence(String),

    #[error("Ya hay una generación en curso: {0}")]
    AlreadyRunning(String),

    #[error("La generación fue cancelada")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, FeedError>;

impl FeedError {
    /// Construye un `MalformedResponse` recortando la respuesta cruda.
    pub fn malformed(reason: impl Into<String>, raw: &str) -> Self {
        Self::MalformedResponse {
            reason: reason.into(),
            excerpt: excerpt(raw),
        }
    }

    /// Fallos transitorios que la política de reintentos puede repetir.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream { status, .. } => *status >= 500 || *status == 429,
            Self::Timeout(_) | Self::Network(_) => true,
            _ => false,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::ProfileMissing
            | Self::MissingInput(_)
            | Self::Validation(_)
            | Self::MalformedResponse { .. } => StatusCode::BAD_REQUEST,
            Self::AlreadyRunning(_) | Self::Cancelled => StatusCode::CONFLICT,
            Self::Upstream { .. }
            | Self::Timeout(_)
            | Self::Network(_)
            | Self::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<String> {
        match self {
            Self::Upstream { body, .. } if !body.is_empty() => Some(excerpt(body)),
            Self::MalformedResponse { excerpt, .. } => Some(excerpt.clone()),
            _ => None,
        }
    }
}

/// Primeros `EXCERPT_CHARS` caracteres (no bytes) de un texto.
pub fn excerpt(raw: &str) -> String {
    raw.chars().take(EXCERPT_CHARS).collect()
}

impl IntoResponse for FeedError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match self.details() {
            Some(details) => json!({ "error": self.to_string(), "details": details }),
            None => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

impl From<neo4rs::Error> for FeedError {
    fn from(err: neo4rs::Error) -> Self {
        FeedError::Persistence(err.to_string())
    }
}
