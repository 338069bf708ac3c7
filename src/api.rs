use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use url::Url;

use crate::{
    app_state::AppState,
    error::{FeedError, Result},
    inflight::Operation,
    models::{Category, CategoryToggles, FeedPayload, ProfileSource, SearchPreferences, SearchType, UserId},
    pipeline::FeedRequest,
};

// --- Payloads de la API ---

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerateFeedPayload {
    #[serde(default)]
    preferences: Option<SearchPreferences>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    search_type: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct KeywordSearchPayload {
    #[serde(default)]
    keywords: String,
    #[serde(default)]
    categories: Option<CategoryToggles>,
}

#[derive(Deserialize)]
pub struct ProfileSourcesPayload {
    sources: Vec<ProfileSource>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedQuery {
    session_id: Option<String>,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/generate-profile", post(generate_profile_handler))
        .route(
            "/api/generate-feed",
            post(generate_feed_handler).delete(cancel_feed_handler),
        )
        .route("/api/keyword-search", post(keyword_search_handler))
        .route("/api/feed", get(list_feed_handler))
        .route("/api/sessions", get(list_sessions_handler))
        .route("/api/profile", get(profile_handler))
        .route("/api/profile/sources", put(profile_sources_handler))
        .route("/api/preferences", put(preferences_handler))
        .route("/api/health", get(health_handler))
        .with_state(app_state)
}

// --- Utilidades ---

/// Resuelve el usuario a partir de `Authorization: Bearer <token>`.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<UserId> {
    let raw = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| FeedError::Auth("falta la cabecera Authorization".to_string()))?;

    let token = raw
        .strip_prefix("Bearer ")
        .unwrap_or(raw)
        .trim();
    if token.is_empty() {
        return Err(FeedError::Auth("token vacío".to_string()));
    }

    state
        .store
        .resolve_user(token)
        .await?
        .ok_or_else(|| FeedError::Auth("token no reconocido".to_string()))
}

/// Cuerpo JSON opcional: un cuerpo vacío equivale al valor por defecto.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_required(body)
}

fn parse_required<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| FeedError::Validation(format!("JSON inválido: {e}")))
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Recuento por categoría, con cero para las que no se generaron.
fn category_counts(payload: &FeedPayload) -> Map<String, Value> {
    Category::ALL
        .iter()
        .map(|c| {
            let count = payload.get(*c).map_or(0, <[_]>::len);
            (c.key().to_string(), json!(count))
        })
        .collect()
}

// --- Handlers ---

#[axum::debug_handler]
async fn generate_profile_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let user_id = authenticate(&state, &headers).await?;
    let guard = state.in_flight.try_begin(&user_id, Operation::Profile)?;

    let outcome = state
        .pipeline
        .generate_profile(&user_id, today(), &guard.token())
        .await
        .inspect_err(|e| warn!(user_id = %user_id, error = %e, "Fallo generando el perfil"))?;

    Ok(Json(json!({
        "success": true,
        "profileText": outcome.profile_text,
        "urlSpecific": outcome.url_specific,
    })))
}

#[axum::debug_handler]
async fn generate_feed_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let user_id = authenticate(&state, &headers).await?;
    let payload: GenerateFeedPayload = parse_body(&body)?;

    let search_type = match payload.search_type.as_deref() {
        None => SearchType::default(),
        Some(raw) => SearchType::parse(raw)
            .ok_or_else(|| FeedError::Validation(format!("searchType desconocido: {raw}")))?,
    };
    let session_id = payload
        .session_id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let guard = state.in_flight.try_begin(&user_id, Operation::Feed)?;
    let request = FeedRequest {
        preferences: payload.preferences,
        session_id,
        search_type,
    };
    let outcome = state
        .pipeline
        .generate_feed(&user_id, request, today(), &guard.token())
        .await
        .inspect_err(|e| warn!(user_id = %user_id, error = %e, "Fallo generando el feed"))?;

    Ok(Json(json!({
        "success": true,
        "itemsGenerated": outcome.items_generated,
        "categories": category_counts(&outcome.payload),
        "skipped": outcome.skipped,
        "sessionId": outcome.session_id,
        "discoveryMetrics": outcome.discovery,
        "preferences": {
            "keywordsUsed": outcome.preferences.keywords().unwrap_or_default(),
            "enabledCategories": outcome.preferences.categories,
            "searchKeywordsCount": outcome.search_keywords.len(),
        },
    })))
}

#[axum::debug_handler]
async fn cancel_feed_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let user_id = authenticate(&state, &headers).await?;
    let cancelled = state.in_flight.cancel(&user_id, Operation::Feed)?;
    info!(user_id = %user_id, cancelled, "Petición de cancelación del feed");
    Ok(Json(json!({ "success": true, "cancelled": cancelled })))
}

#[axum::debug_handler]
async fn keyword_search_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let user_id = authenticate(&state, &headers).await?;
    let payload: KeywordSearchPayload = parse_body(&body)?;

    let guard = state.in_flight.try_begin(&user_id, Operation::KeywordSearch)?;
    let outcome = state
        .pipeline
        .keyword_search(&payload.keywords, payload.categories, today(), &guard.token())
        .await
        .inspect_err(|e| warn!(user_id = %user_id, error = %e, "Fallo en la búsqueda por palabras clave"))?;

    Ok(Json(json!({
        "success": true,
        "keywords": &outcome.keywords,
        "resultsGenerated": outcome.payload.total(),
        "categories": category_counts(&outcome.payload),
        "data": &outcome.payload,
        "skipped": &outcome.skipped,
        "searchMetrics": {
            "searchType": "keyword-only",
            "keywordsUsed": &outcome.keywords,
            "profileBiasApplied": false,
            "searchDate": outcome.search_date,
        },
    })))
}

#[axum::debug_handler]
async fn list_feed_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<FeedQuery>,
) -> Result<Json<Value>> {
    let user_id = authenticate(&state, &headers).await?;
    let session_id = params.session_id.as_deref().filter(|s| !s.is_empty());
    let items = state.store.list_items(&user_id, session_id).await?;
    Ok(Json(json!({ "sessionId": session_id, "items": items })))
}

#[axum::debug_handler]
async fn list_sessions_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let user_id = authenticate(&state, &headers).await?;
    let sessions = state.store.list_sessions(&user_id).await?;
    Ok(Json(json!({ "sessions": sessions })))
}

#[axum::debug_handler]
async fn profile_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let user_id = authenticate(&state, &headers).await?;
    let profile = state.store.profile(&user_id).await?.unwrap_or_default();
    let sources = state.store.profile_sources(&user_id).await?;
    let busy = state.in_flight.is_running(&user_id, Operation::Feed)?;

    Ok(Json(json!({
        "profileText": profile.text(),
        "lastFeedGeneratedAt": profile.last_feed_generated_at,
        "preferences": profile.preferences.unwrap_or_default(),
        "sources": sources,
        "feedInProgress": busy,
    })))
}

#[axum::debug_handler]
async fn profile_sources_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let user_id = authenticate(&state, &headers).await?;
    let payload: ProfileSourcesPayload = parse_required(&body)?;

    for source in &payload.sources {
        if let Some(url) = source.url() {
            Url::parse(url).map_err(|e| FeedError::Validation(format!("URL inválida '{url}': {e}")))?;
        }
    }

    state
        .store
        .replace_profile_sources(&user_id, &payload.sources)
        .await?;
    info!(user_id = %user_id, sources = payload.sources.len(), "Fuentes del perfil actualizadas");
    Ok(Json(json!({ "success": true, "count": payload.sources.len() })))
}

#[axum::debug_handler]
async fn preferences_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let user_id = authenticate(&state, &headers).await?;
    let preferences: SearchPreferences = parse_body(&body)?;
    state.store.save_preferences(&user_id, &preferences).await?;
    Ok(Json(json!({ "success": true, "preferences": preferences })))
}

#[axum::debug_handler]
async fn health_handler(State(state): State<AppState>) -> Result<Json<Value>> {
    state.store.ping().await?;
    Ok(Json(json!({
        "status": "ok",
        "backend": state.config.store_backend.as_str(),
        "model": state.config.search_model,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::inflight::InFlightRegistry;
    use crate::pipeline::{FeedPipeline, PipelineOptions};
    use crate::search::SearchClient;
    use crate::store::{FeedStore, MemoryFeedStore};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};
    use tower::ServiceExt;

    const FEED_REPLY: &str = r#"{
        "publications": [{"title": "Folding at scale", "authors": ["A. Author"]}],
        "patents": [],
        "funding_opportunities": [{"title": "NIH R01"}],
        "trending_science_news": [{"title": "Cryo-EM news", "source": "Nature"}]
    }"#;

    struct CannedSearch {
        replies: Mutex<VecDeque<String>>,
    }

    #[async_trait]
    impl SearchClient for CannedSearch {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| FeedError::Upstream {
                    status: 503,
                    body: "no more replies".into(),
                })
        }
    }

    fn state_with(replies: &[&str], store: Arc<MemoryFeedStore>) -> AppState {
        let vars: HashMap<&str, &str> =
            HashMap::from([("STORE_BACKEND", "memory"), ("PERPLEXITY_API_KEY", "test")]);
        let config = AppConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        let search = Arc::new(CannedSearch {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
        });
        let store_dyn: Arc<dyn FeedStore> = store;
        AppState {
            config: Arc::new(config),
            pipeline: FeedPipeline::new(search, store_dyn.clone(), PipelineOptions::default()),
            store: store_dyn,
            in_flight: InFlightRegistry::new(),
        }
    }

    fn user_store() -> Arc<MemoryFeedStore> {
        Arc::new(MemoryFeedStore::new().with_user("tok", "u1"))
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", "Bearer tok")
            .header("content-type", "application/json");
        match body {
            Some(json) => builder.body(Body::from(json.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(state: &AppState, req: Request<Body>) -> (StatusCode, Value) {
        let response = create_router(state.clone()).oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn health_needs_no_token() {
        let state = state_with(&[], user_store());
        let req = Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&state, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backend"], "memory");
    }

    #[tokio::test]
    async fn unknown_token_is_unauthorized() {
        let state = state_with(&[], user_store());
        let req = Request::builder()
            .method("POST")
            .uri("/api/generate-feed")
            .header("authorization", "Bearer nope")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&state, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].as_str().unwrap().contains("token no reconocido"));
    }

    #[tokio::test]
    async fn feed_without_profile_is_bad_request() {
        let state = state_with(&[FEED_REPLY], user_store());
        let (status, body) = send(&state, request("POST", "/api/generate-feed", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Perfil"));
    }

    #[tokio::test]
    async fn feed_run_reports_counts_and_lists_stored_items() {
        let store = user_store();
        store
            .save_profile_text("u1", "Dr. Jane Roe studies protein folding.", Utc::now())
            .await
            .unwrap();
        let state = state_with(&[FEED_REPLY], store);

        let body = json!({ "preferences": { "categories": { "patents": false } } });
        let (status, body) = send(&state, request("POST", "/api/generate-feed", Some(body))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["itemsGenerated"], 3);
        assert_eq!(body["categories"]["patents"], 0);
        assert_eq!(body["categories"]["trending_science_news"], 1);
        assert_eq!(body["preferences"]["enabledCategories"]["patents"], false);
        assert_eq!(body["discoveryMetrics"]["researcherName"], "Jane Roe");

        let (status, body) = send(&state, request("GET", "/api/feed", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["items"].as_array().unwrap().len(), 3);
        assert!(!state.in_flight.is_running("u1", Operation::Feed).unwrap());
    }

    #[tokio::test]
    async fn overlapping_feed_request_conflicts_and_can_be_cancelled() {
        let store = user_store();
        store
            .save_profile_text("u1", "Profile", Utc::now())
            .await
            .unwrap();
        let state = state_with(&[FEED_REPLY], store);
        let running = state.in_flight.try_begin("u1", Operation::Feed).unwrap();

        let (status, _) = send(&state, request("POST", "/api/generate-feed", None)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(&state, request("DELETE", "/api/generate-feed", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], true);
        assert!(running.token().is_cancelled());
    }

    #[tokio::test]
    async fn malformed_model_output_returns_excerpt() {
        let store = user_store();
        store
            .save_profile_text("u1", "Profile", Utc::now())
            .await
            .unwrap();
        let state = state_with(&["Sorry, nothing found."], store);

        let (status, body) = send(&state, request("POST", "/api/generate-feed", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["details"], "Sorry, nothing found.");
    }

    #[tokio::test]
    async fn keyword_search_rejects_blank_keywords() {
        let state = state_with(&[FEED_REPLY], user_store());
        let body = json!({ "keywords": "  " });
        let (status, _) = send(&state, request("POST", "/api/keyword-search", Some(body))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn keyword_search_returns_data_without_persisting() {
        let state = state_with(&[FEED_REPLY], user_store());
        let body = json!({ "keywords": "cryo-EM", "categories": { "patents": false } });
        let (status, body) = send(&state, request("POST", "/api/keyword-search", Some(body))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["resultsGenerated"], 3);
        assert_eq!(body["searchMetrics"]["profileBiasApplied"], false);
        assert!(body["data"].get("patents").is_none());

        let (_, feed) = send(&state, request("GET", "/api/feed", None)).await;
        assert!(feed["items"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sources_then_profile_generation() {
        let state = state_with(&["<think>x</think>Jane Roe, structural biologist."], user_store());

        let bad = json!({ "sources": [{ "url": "not a url", "profileType": "website" }] });
        let (status, _) = send(&state, request("PUT", "/api/profile/sources", Some(bad))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let sources = json!({ "sources": [
            { "url": "https://orcid.org/0000-0001", "profileType": "orcid" },
            { "profileType": "keywords", "keywords": "cryo-EM" }
        ]});
        let (status, body) = send(&state, request("PUT", "/api/profile/sources", Some(sources))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 2);

        let (status, body) = send(&state, request("POST", "/api/generate-profile", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["profileText"], "Jane Roe, structural biologist.");

        let (_, profile) = send(&state, request("GET", "/api/profile", None)).await;
        assert_eq!(profile["profileText"], "Jane Roe, structural biologist.");
        assert_eq!(profile["sources"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn saved_preferences_round_trip() {
        let state = state_with(&[], user_store());
        let prefs = json!({ "keywords": "perovskite", "itemsPerCategory": 6, "timeRange": "past_year" });
        let (status, _) = send(&state, request("PUT", "/api/preferences", Some(prefs))).await;
        assert_eq!(status, StatusCode::OK);

        let (_, profile) = send(&state, request("GET", "/api/profile", None)).await;
        assert_eq!(profile["preferences"]["keywords"], "perovskite");
        assert_eq!(profile["preferences"]["itemsPerCategory"], 6);
        assert_eq!(profile["preferences"]["categories"]["patents"], true);
    }

    #[tokio::test]
    async fn oversized_item_count_is_clamped_not_rejected() {
        let state = state_with(&[], user_store());
        let prefs = json!({ "itemsPerCategory": 300 });
        let (status, _) = send(&state, request("PUT", "/api/preferences", Some(prefs))).await;
        assert_eq!(status, StatusCode::OK);

        let (_, profile) = send(&state, request("GET", "/api/profile", None)).await;
        assert_eq!(profile["preferences"]["itemsPerCategory"], 10);
    }

    #[tokio::test]
    async fn session_run_is_listed_separately() {
        let store = user_store();
        store
            .save_profile_text("u1", "Profile", Utc::now())
            .await
            .unwrap();
        let state = state_with(&[FEED_REPLY], store);

        let body = json!({ "sessionId": "s-1" });
        let (status, _) = send(&state, request("POST", "/api/generate-feed", Some(body))).await;
        assert_eq!(status, StatusCode::OK);

        let (_, current) = send(&state, request("GET", "/api/feed", None)).await;
        assert!(current["items"].as_array().unwrap().is_empty());
        let (_, snapshot) = send(&state, request("GET", "/api/feed?sessionId=s-1", None)).await;
        assert_eq!(snapshot["items"].as_array().unwrap().len(), 3);
        let (_, sessions) = send(&state, request("GET", "/api/sessions", None)).await;
        assert_eq!(sessions["sessions"][0]["id"], "s-1");
    }
}
