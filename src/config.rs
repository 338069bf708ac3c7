//! Carga y gestión de configuración de la aplicación (almacén + API de búsqueda).

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use url::Url;

use crate::normalize::FundingDeadlinePolicy;
use crate::search::RetryPolicy;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Neo4j,
    Memory,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Neo4j => "neo4j",
            Self::Memory => "memory",
        }
    }
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "neo4j" => Ok(Self::Neo4j),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow!("Backend de almacenamiento no soportado: {other}")),
        }
    }
}

/// Credenciales de Neo4j, sólo presentes con el backend `neo4j`.
#[derive(Clone, Debug)]
pub struct Neo4jConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub store_backend: StoreBackend,
    pub neo4j: Option<Neo4jConfig>,
    /// Usuario semilla `(token, user_id)` para el backend en memoria.
    pub dev_user: Option<(String, String)>,

    pub perplexity_api_key: String,
    pub perplexity_base_url: String,
    pub search_model: String,
    pub search_timeout: Duration,
    pub retry: RetryPolicy,
    pub funding_policy: FundingDeadlinePolicy,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Construye la configuración a partir de una función de búsqueda de claves.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| lookup(key).ok_or_else(|| anyhow!("Falta {key} en el entorno"));

        let server_addr = lookup("SERVER_ADDR").unwrap_or_else(|| "127.0.0.1:3322".to_string());

        let store_backend: StoreBackend = lookup("STORE_BACKEND")
            .unwrap_or_else(|| "neo4j".to_string())
            .parse()?;

        let neo4j = match store_backend {
            StoreBackend::Neo4j => Some(Neo4jConfig {
                uri: required("NEO4J_URI")?,
                user: required("NEO4J_USER")?,
                password: required("NEO4J_PASSWORD")?,
            }),
            StoreBackend::Memory => None,
        };

        let dev_user = lookup("DEV_API_TOKEN").map(|token| {
            let user_id = lookup("DEV_USER_ID").unwrap_or_else(|| "dev-user".to_string());
            (token, user_id)
        });

        let perplexity_api_key = required("PERPLEXITY_API_KEY")?;
        let perplexity_base_url = lookup("PERPLEXITY_BASE_URL")
            .unwrap_or_else(|| "https://api.perplexity.ai".to_string());
        Url::parse(&perplexity_base_url)
            .with_context(|| format!("PERPLEXITY_BASE_URL no es una URL válida: {perplexity_base_url}"))?;

        let search_model =
            lookup("SEARCH_MODEL").unwrap_or_else(|| "sonar-deep-research".to_string());

        let search_timeout = Duration::from_secs(parse_or(&lookup, "SEARCH_TIMEOUT_SECS", 180)?);

        let retry = RetryPolicy {
            max_attempts: parse_or(&lookup, "SEARCH_MAX_ATTEMPTS", 3u32)?.max(1),
            base_delay: Duration::from_millis(parse_or(&lookup, "SEARCH_BACKOFF_BASE_MS", 2_000)?),
            max_delay: Duration::from_millis(parse_or(&lookup, "SEARCH_BACKOFF_MAX_MS", 30_000)?),
        };

        let funding_policy = match lookup("FUNDING_DEADLINE_POLICY") {
            Some(raw) => raw
                .parse::<FundingDeadlinePolicy>()
                .map_err(|e| anyhow!(e))?,
            None => FundingDeadlinePolicy::default(),
        };

        Ok(Self {
            server_addr,
            store_backend,
            neo4j,
            dev_user,
            perplexity_api_key,
            perplexity_base_url,
            search_model,
            search_timeout,
            retry,
            funding_policy,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Valor inválido para {key} ({raw}): {e}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn memory_backend_uses_defaults() {
        let cfg = AppConfig::from_lookup(lookup_from(&[
            ("STORE_BACKEND", "memory"),
            ("PERPLEXITY_API_KEY", "pplx-test"),
        ]))
        .unwrap();

        assert_eq!(cfg.store_backend, StoreBackend::Memory);
        assert!(cfg.neo4j.is_none());
        assert_eq!(cfg.search_model, "sonar-deep-research");
        assert_eq!(cfg.search_timeout, Duration::from_secs(180));
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.funding_policy, FundingDeadlinePolicy::Keep);
        assert!(cfg.dev_user.is_none());
    }

    #[test]
    fn neo4j_backend_requires_credentials() {
        let err = AppConfig::from_lookup(lookup_from(&[("PERPLEXITY_API_KEY", "k")])).unwrap_err();
        assert!(err.to_string().contains("NEO4J_URI"));
    }

    #[test]
    fn rejects_invalid_numbers_and_policies() {
        let bad_timeout = AppConfig::from_lookup(lookup_from(&[
            ("STORE_BACKEND", "memory"),
            ("PERPLEXITY_API_KEY", "k"),
            ("SEARCH_TIMEOUT_SECS", "soon"),
        ]));
        assert!(bad_timeout.is_err());

        let bad_policy = AppConfig::from_lookup(lookup_from(&[
            ("STORE_BACKEND", "memory"),
            ("PERPLEXITY_API_KEY", "k"),
            ("FUNDING_DEADLINE_POLICY", "sometimes"),
        ]));
        assert!(bad_policy.is_err());
    }

    #[test]
    fn reads_overrides() {
        let cfg = AppConfig::from_lookup(lookup_from(&[
            ("STORE_BACKEND", "memory"),
            ("PERPLEXITY_API_KEY", "k"),
            ("SEARCH_MAX_ATTEMPTS", "0"),
            ("FUNDING_DEADLINE_POLICY", "drop_expired"),
            ("DEV_API_TOKEN", "secret"),
        ]))
        .unwrap();
        assert_eq!(cfg.retry.max_attempts, 1);
        assert_eq!(cfg.funding_policy, FundingDeadlinePolicy::DropExpired);
        assert_eq!(cfg.dev_user, Some(("secret".to_string(), "dev-user".to_string())));
    }
}
