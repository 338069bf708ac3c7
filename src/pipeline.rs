//! Orquestación: prompt → búsqueda → extracción → normalización → persistencia.
//!
//! Las tres entradas (perfil, feed, búsqueda por palabras clave) comparten
//! las mismas etapas y sólo difieren en la plantilla de prompt y en si el
//! resultado se persiste. Cualquier fallo antes de persistir deja intactos
//! los elementos almacenados.

use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{FeedError, Result};
use crate::extract::{parse_payload, strip_reasoning};
use crate::models::{
    CategoryToggles, FeedPayload, FeedSession, ProfileSource, SearchPreferences, SearchType,
    SourceKind,
};
use crate::normalize::{normalize, FundingDeadlinePolicy, NormalizeOptions, SkippedRecord};
use crate::prompt::{BuiltPrompt, PromptTemplate};
use crate::search::SearchClient;
use crate::store::FeedStore;

/// Frases que delatan un perfil construido con una búsqueda genérica por nombre.
const GENERAL_SEARCH_INDICATORS: [&str; 6] = [
    "multiple individuals named",
    "different people with the same name",
    "another person named",
    "various professionals named",
    "several people named",
    "different individuals with this name",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineOptions {
    pub funding_policy: FundingDeadlinePolicy,
}

/// Petición de generación de feed.
#[derive(Debug, Clone, Default)]
pub struct FeedRequest {
    /// Si falta, se usan las preferencias guardadas y, en su defecto, las de por defecto.
    pub preferences: Option<SearchPreferences>,
    /// Con sesión, el resultado se guarda como instantánea y el feed actual no se toca.
    pub session_id: Option<String>,
    pub search_type: SearchType,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryMetrics {
    pub researcher_name: Option<String>,
    pub institution: Option<String>,
    pub eligible_regions: Vec<String>,
    pub content_cutoff_date: NaiveDate,
    pub exclusion_filters_applied: bool,
    pub geographic_filtering_applied: bool,
}

impl DiscoveryMetrics {
    fn from_prompt(built: &BuiltPrompt) -> Self {
        Self {
            researcher_name: built.identity.name.clone(),
            institution: built.identity.institution.clone(),
            eligible_regions: built.eligible_regions.iter().map(|r| r.to_string()).collect(),
            content_cutoff_date: built.cutoff,
            exclusion_filters_applied: built.identity.has_exclusions(),
            geographic_filtering_applied: built.eligible_regions.len() > 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedOutcome {
    pub payload: FeedPayload,
    pub items_generated: usize,
    pub skipped: Vec<SkippedRecord>,
    pub discovery: DiscoveryMetrics,
    pub preferences: SearchPreferences,
    pub search_keywords: Vec<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProfileOutcome {
    pub profile_text: String,
    /// `false` si el texto parece salir de una búsqueda genérica por nombre.
    pub url_specific: bool,
}

#[derive(Debug, Clone)]
pub struct KeywordOutcome {
    pub keywords: String,
    pub payload: FeedPayload,
    pub skipped: Vec<SkippedRecord>,
    pub search_date: NaiveDate,
}

#[derive(Clone)]
pub struct FeedPipeline {
    search: Arc<dyn SearchClient>,
    store: Arc<dyn FeedStore>,
    options: PipelineOptions,
}

impl FeedPipeline {
    pub fn new(
        search: Arc<dyn SearchClient>,
        store: Arc<dyn FeedStore>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            search,
            store,
            options,
        }
    }

    /// Genera el texto del perfil a partir de las URLs y palabras clave enviadas.
    pub async fn generate_profile(
        &self,
        user_id: &str,
        today: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<ProfileOutcome> {
        let sources = self.store.profile_sources(user_id).await?;
        let url_count = sources.iter().filter(|s| s.url().is_some()).count();
        let has_keywords = sources
            .iter()
            .any(|s| s.profile_type == SourceKind::Keywords && s.keywords().is_some());
        if url_count == 0 && !has_keywords {
            return Err(FeedError::MissingInput(
                "no hay URLs ni palabras clave para generar el perfil".to_string(),
            ));
        }
        info!(user_id, urls = url_count, has_keywords, "Generando perfil");

        let built = PromptTemplate::Profile { sources: &sources }.build(today);
        debug!(prompt_len = built.text.len(), "Prompt de perfil construido");

        let raw = self.complete(&built.text, cancel).await?;
        let profile_text = strip_reasoning(&raw).to_string();
        if profile_text.is_empty() {
            return Err(FeedError::malformed("el perfil generado está vacío", &raw));
        }
        let url_specific = is_url_specific(&profile_text, &sources);

        ensure_not_cancelled(cancel)?;
        self.store
            .save_profile_text(user_id, &profile_text, Utc::now())
            .await?;
        info!(user_id, profile_len = profile_text.len(), "Perfil actualizado");

        Ok(ProfileOutcome {
            profile_text,
            url_specific,
        })
    }

    /// Genera el feed del usuario y sustituye el feed actual (o crea una sesión).
    pub async fn generate_feed(
        &self,
        user_id: &str,
        request: FeedRequest,
        today: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<FeedOutcome> {
        if let Some(session_id) = request.session_id.as_deref() {
            if self.store.session(user_id, session_id).await?.is_some() {
                return Err(FeedError::Validation(format!(
                    "la sesión '{session_id}' ya existe y es inmutable"
                )));
            }
        }

        let profile = self.store.profile(user_id).await?.unwrap_or_default();
        let preferences = request
            .preferences
            .or_else(|| profile.preferences.clone())
            .unwrap_or_default();

        let template = match request.search_type {
            SearchType::ProfileFeed => PromptTemplate::Feed {
                profile_text: profile.text().ok_or(FeedError::ProfileMissing)?,
                preferences: &preferences,
            },
            SearchType::KeywordSearch => PromptTemplate::KeywordSearch {
                keywords: preferences.keywords().ok_or_else(|| {
                    FeedError::Validation("la búsqueda por palabras clave necesita keywords".to_string())
                })?,
                preferences: &preferences,
            },
        };

        let built = template.build(today);
        info!(
            user_id,
            search_type = request.search_type.as_str(),
            prompt_len = built.text.len(),
            categories = ?preferences.categories.enabled(),
            "Prompt de feed construido"
        );

        let map = self.search_payload(&built.text, cancel).await?;
        let normalized = normalize(&map, &preferences.categories, &self.normalize_options(today));

        ensure_not_cancelled(cancel)?;
        let now = Utc::now();
        let items = normalized
            .payload
            .to_items(user_id, request.session_id.as_deref(), now);

        match request.session_id.as_deref() {
            None => {
                self.store.replace_current_feed(user_id, &items, now).await?;
            }
            Some(session_id) => {
                let session = FeedSession {
                    id: session_id.to_string(),
                    user_id: user_id.to_string(),
                    title: session_title(request.search_type, &preferences, today),
                    search_type: request.search_type,
                    preferences: preferences.clone(),
                    created_at: now,
                };
                self.store
                    .create_session_snapshot(&session, &items, now)
                    .await?;
            }
        }
        info!(
            user_id,
            inserted = items.len(),
            skipped = normalized.skipped.len(),
            session_id = request.session_id.as_deref().unwrap_or(""),
            "Feed persistido"
        );

        Ok(FeedOutcome {
            items_generated: items.len(),
            payload: normalized.payload,
            skipped: normalized.skipped,
            discovery: DiscoveryMetrics::from_prompt(&built),
            preferences,
            search_keywords: built.search_keywords,
            session_id: request.session_id,
        })
    }

    /// Búsqueda sin sesgo de perfil; el resultado no se persiste.
    pub async fn keyword_search(
        &self,
        keywords: &str,
        categories: Option<CategoryToggles>,
        today: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<KeywordOutcome> {
        let keywords = keywords.trim();
        if keywords.is_empty() {
            return Err(FeedError::Validation("las palabras clave no pueden estar vacías".to_string()));
        }

        let preferences = SearchPreferences {
            keywords: Some(keywords.to_string()),
            categories: categories.unwrap_or_default(),
            ..SearchPreferences::default()
        };
        let built = PromptTemplate::KeywordSearch {
            keywords,
            preferences: &preferences,
        }
        .build(today);
        info!(keywords, prompt_len = built.text.len(), "Búsqueda por palabras clave");

        let map = self.search_payload(&built.text, cancel).await?;
        let normalized = normalize(&map, &preferences.categories, &self.normalize_options(today));
        ensure_not_cancelled(cancel)?;

        Ok(KeywordOutcome {
            keywords: keywords.to_string(),
            payload: normalized.payload,
            skipped: normalized.skipped,
            search_date: today,
        })
    }

    fn normalize_options(&self, today: NaiveDate) -> NormalizeOptions {
        NormalizeOptions {
            funding_policy: self.options.funding_policy,
            today,
        }
    }

    /// Llamada al buscador, abortada si se cancela la ejecución.
    async fn complete(&self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        let start = Instant::now();
        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Ejecución cancelada durante la llamada al buscador");
                return Err(FeedError::Cancelled);
            }
            result = self.search.complete(prompt) => result?,
        };
        debug!(duration_ms = start.elapsed().as_millis() as u64, "Buscador completado");
        Ok(raw)
    }

    async fn search_payload(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<Map<String, Value>> {
        let raw = self.complete(prompt, cancel).await?;
        parse_payload(&raw)
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        info!("Ejecución cancelada antes de persistir");
        return Err(FeedError::Cancelled);
    }
    Ok(())
}

fn session_title(search_type: SearchType, preferences: &SearchPreferences, today: NaiveDate) -> String {
    match (search_type, preferences.keywords()) {
        (SearchType::KeywordSearch, Some(keywords)) => format!("Search: {keywords}"),
        _ => format!("Feed {today}"),
    }
}

/// Comprueba si el perfil parece basado en las URLs y no en una búsqueda por nombre.
fn is_url_specific(profile_text: &str, sources: &[ProfileSource]) -> bool {
    let lower = profile_text.to_lowercase();
    let generic = GENERAL_SEARCH_INDICATORS
        .iter()
        .any(|indicator| lower.contains(indicator));

    let cites_sources = sources.iter().filter_map(ProfileSource::url).any(|url| {
        let domain = if url.contains("linkedin.com") {
            "linkedin"
        } else if url.contains("scholar.google") {
            "scholar"
        } else if url.contains("orcid.org") {
            "orcid"
        } else if url.contains("github.com") {
            "github"
        } else {
            return false;
        };
        lower.contains(domain)
    });

    if generic && !cites_sources {
        warn!("El perfil podría basarse en una búsqueda genérica y no en las URLs enviadas");
        false
    } else {
        true
    }
}
