// Módulos de la aplicación
mod api;
mod app_state;
mod config;
mod error;
mod extract;
mod inflight;
mod models;
mod neo4j_client;
mod normalize;
mod pipeline;
mod prompt;
mod search;
mod store;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::{AppConfig, StoreBackend};
use crate::inflight::InFlightRegistry;
use crate::neo4j_client::Neo4jFeedStore;
use crate::pipeline::{FeedPipeline, PipelineOptions};
use crate::search::PerplexityClient;
use crate::store::{FeedStore, MemoryFeedStore};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = AppConfig::from_env().context("Error al cargar la configuración")?;

    // 3. Preparar el almacén (Neo4j o memoria)
    let store = build_store(&cfg).await?;

    // 4. Cliente de búsqueda y pipeline
    let search = Arc::new(PerplexityClient::from_config(&cfg));
    info!(model = search.model(), "Cliente de búsqueda listo");
    let pipeline = FeedPipeline::new(
        search,
        Arc::clone(&store),
        PipelineOptions {
            funding_policy: cfg.funding_policy,
        },
    );

    // 5. Crear estado compartido de la aplicación
    let app_state = AppState {
        config: Arc::new(cfg.clone()),
        pipeline,
        store,
        in_flight: InFlightRegistry::new(),
    };

    // 6. Configurar el router de la API
    let app = Router::new()
        .merge(api::create_router(app_state))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 7. Iniciar el servidor
    let listener = tokio::net::TcpListener::bind(&cfg.server_addr)
        .await
        .with_context(|| format!("No se pudo escuchar en {}", cfg.server_addr))?;
    info!("🚀 Servidor escuchando en http://{}", cfg.server_addr);

    // Apagado ordenado con Ctrl+C.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("No se pudo escuchar la señal de apagado: {e}");
                return;
            }
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await?;

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}

async fn build_store(cfg: &AppConfig) -> Result<Arc<dyn FeedStore>> {
    match cfg.store_backend {
        StoreBackend::Neo4j => {
            let neo4j = cfg
                .neo4j
                .as_ref()
                .context("Faltan las credenciales de Neo4j")?;
            let store = Neo4jFeedStore::connect(neo4j)
                .await
                .context("Error conectando a Neo4j")?;
            store
                .ensure_schema()
                .await
                .context("Error asegurando el esquema de Neo4j")?;
            if let Some((token, user_id)) = &cfg.dev_user {
                store.seed_user(token, user_id).await?;
                info!(user_id = %user_id, "Usuario de desarrollo registrado en Neo4j");
            }
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("Usando almacén en memoria: los datos se pierden al reiniciar");
            let mut store = MemoryFeedStore::new();
            if let Some((token, user_id)) = &cfg.dev_user {
                store = store.with_user(token.clone(), user_id.clone());
                info!(user_id = %user_id, "Usuario de desarrollo registrado en memoria");
            }
            Ok(Arc::new(store))
        }
    }
}
