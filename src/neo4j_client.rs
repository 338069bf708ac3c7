use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use neo4rs::{query, Graph, Query, Row, Txn};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Neo4jConfig;
use crate::error::{FeedError, Result};
use crate::models::{
    Category, FeedItem, FeedSession, ItemMetadata, Profile, ProfileSource, SearchPreferences,
    SearchType, SourceKind, UserId,
};
use crate::store::FeedStore;

/// Almacén del feed sobre Neo4j.
///
/// Convenciones de propiedades: las fechas se guardan como cadenas RFC 3339,
/// los metadatos y preferencias como JSON serializado, y los opcionales
/// ausentes como cadena vacía (un `session_id` vacío marca el feed actual).
#[derive(Clone)]
pub struct Neo4jFeedStore {
    graph: Arc<Graph>,
}

impl Neo4jFeedStore {
    pub async fn connect(cfg: &Neo4jConfig) -> anyhow::Result<Self> {
        let url = Url::parse(&cfg.uri)?;
        let host = url.host_str().unwrap_or("localhost");
        let port = url.port().unwrap_or(7687);
        let addr = format!("{host}:{port}");

        info!("Conectando a Neo4j en {addr}...");
        let graph = Graph::new(&addr, &cfg.user, &cfg.password).await?;
        info!("Conexión a Neo4j OK");
        Ok(Self {
            graph: Arc::new(graph),
        })
    }

    /// Crea constraints de unicidad para :User, :FeedItem y :FeedSession.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        let statements = [
            "CREATE CONSTRAINT user_id IF NOT EXISTS
             FOR (u:User)
             REQUIRE u.id IS UNIQUE",
            "CREATE CONSTRAINT user_api_token IF NOT EXISTS
             FOR (u:User)
             REQUIRE u.api_token IS UNIQUE",
            "CREATE CONSTRAINT feed_item_id IF NOT EXISTS
             FOR (i:FeedItem)
             REQUIRE i.id IS UNIQUE",
            "CREATE CONSTRAINT feed_session_id IF NOT EXISTS
             FOR (s:FeedSession)
             REQUIRE s.id IS UNIQUE",
        ];

        for stmt in statements {
            self.graph.run(query(stmt)).await?;
        }

        info!("Esquema de Neo4j asegurado (constraints básicos creados).");
        Ok(())
    }

    /// Da de alta (o actualiza) un usuario con su token de acceso.
    pub async fn seed_user(&self, token: &str, user_id: &str) -> Result<()> {
        self.graph
            .run(
                query("MERGE (u:User {id: $id}) SET u.api_token = $token")
                    .param("id", user_id.to_string())
                    .param("token", token.to_string()),
            )
            .await?;
        Ok(())
    }

    async fn rows(&self, q: Query) -> Result<Vec<Row>> {
        let mut cursor = self.graph.execute(q).await?;
        let mut rows = Vec::new();
        while let Some(row) = cursor.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }
}

/// Cierra la transacción: commit si `outcome` es correcto, rollback si no.
async fn finish_txn(txn: Txn, outcome: Result<()>) -> Result<()> {
    match outcome {
        Ok(()) => {
            txn.commit().await?;
            Ok(())
        }
        Err(err) => {
            if let Err(rb) = txn.rollback().await {
                warn!(error = %rb, "Fallo al deshacer la transacción");
            }
            Err(err)
        }
    }
}

fn insert_item_query(item: &FeedItem) -> Query {
    query(
        "CREATE (i:FeedItem {
            id: $id, user_id: $user_id, item_type: $item_type, title: $title,
            summary: $summary, url: $url, metadata: $metadata,
            session_id: $session_id, created_at: $created_at
         })",
    )
    .param("id", item.id.clone())
    .param("user_id", item.user_id.clone())
    .param("item_type", item.item_type.item_type().to_string())
    .param("title", item.title.clone())
    .param("summary", item.summary.clone().unwrap_or_default())
    .param("url", item.url.clone().unwrap_or_default())
    .param("metadata", item.metadata.to_json().to_string())
    .param("session_id", item.session_id.clone().unwrap_or_default())
    .param("created_at", item.created_at.to_rfc3339())
}

const DELETE_UNSESSIONED: &str = "MATCH (i:FeedItem {user_id: $user_id, session_id: ''})
     WITH collect(i) AS items
     FOREACH (n IN items | DELETE n)
     RETURN size(items) AS deleted";

const TOUCH_LAST_GENERATED: &str =
    "MERGE (u:User {id: $id}) SET u.last_feed_generated_at = $at";

async fn write_feed(txn: &Txn, user_id: &str, items: &[FeedItem], at: DateTime<Utc>) -> Result<()> {
    txn.run(query(DELETE_UNSESSIONED).param("user_id", user_id.to_string()))
        .await?;
    for item in items {
        txn.run(insert_item_query(item)).await?;
    }
    txn.run(
        query(TOUCH_LAST_GENERATED)
            .param("id", user_id.to_string())
            .param("at", at.to_rfc3339()),
    )
    .await?;
    Ok(())
}

fn create_session_query(session: &FeedSession) -> Result<Query> {
    let preferences = serde_json::to_string(&session.preferences)
        .map_err(|e| FeedError::Persistence(e.to_string()))?;
    Ok(query(
        "CREATE (s:FeedSession {
            id: $id, user_id: $user_id, title: $title,
            search_type: $search_type, preferences: $preferences,
            created_at: $created_at
         })",
    )
    .param("id", session.id.clone())
    .param("user_id", session.user_id.clone())
    .param("title", session.title.clone())
    .param("search_type", session.search_type.as_str().to_string())
    .param("preferences", preferences)
    .param("created_at", session.created_at.to_rfc3339()))
}

/// Sesión, elementos y marca de tiempo. El constraint `feed_session_id`
/// hace fallar (y deshacer) un id repetido.
async fn write_snapshot(
    txn: &Txn,
    session: &FeedSession,
    items: &[FeedItem],
    at: DateTime<Utc>,
) -> Result<()> {
    txn.run(create_session_query(session)?).await?;
    for item in items {
        txn.run(insert_item_query(item)).await?;
    }
    txn.run(
        query(TOUCH_LAST_GENERATED)
            .param("id", session.user_id.clone())
            .param("at", at.to_rfc3339()),
    )
    .await?;
    Ok(())
}

async fn write_sources(txn: &Txn, user_id: &str, sources: &[ProfileSource]) -> Result<()> {
    txn.run(
        query("MATCH (s:ProfileSource {user_id: $user_id}) DELETE s")
            .param("user_id", user_id.to_string()),
    )
    .await?;
    for (position, source) in sources.iter().enumerate() {
        txn.run(
            query(
                "CREATE (s:ProfileSource {
                    user_id: $user_id, position: $position, url: $url,
                    profile_type: $profile_type, keywords: $keywords
                 })",
            )
            .param("user_id", user_id.to_string())
            .param("position", position as i64)
            .param("url", source.url().unwrap_or_default().to_string())
            .param("profile_type", source.profile_type.as_str().to_string())
            .param("keywords", source.keywords().unwrap_or_default().to_string()),
        )
        .await?;
    }
    Ok(())
}

// --- Conversión de filas ---

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn required(row: &Row, key: &str) -> Result<String> {
    row.get::<String>(key)
        .ok_or_else(|| FeedError::Persistence(format!("falta la propiedad '{key}'")))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| FeedError::Persistence(format!("fecha inválida '{raw}': {e}")))
}

fn parse_preferences(raw: &str) -> Result<SearchPreferences> {
    serde_json::from_str(raw)
        .map_err(|e| FeedError::Persistence(format!("preferencias inválidas: {e}")))
}

fn item_from_row(row: &Row) -> Result<FeedItem> {
    let raw_type = required(row, "item_type")?;
    let item_type = Category::from_item_type(&raw_type)
        .ok_or_else(|| FeedError::Persistence(format!("item_type desconocido: {raw_type}")))?;
    let metadata_json: serde_json::Value = serde_json::from_str(&required(row, "metadata")?)
        .map_err(|e| FeedError::Persistence(format!("metadatos inválidos: {e}")))?;
    let metadata = ItemMetadata::from_json(item_type, metadata_json)
        .map_err(|e| FeedError::Persistence(format!("metadatos inválidos: {e}")))?;

    Ok(FeedItem {
        id: required(row, "id")?,
        user_id: required(row, "user_id")?,
        item_type,
        title: required(row, "title")?,
        summary: non_empty(row.get("summary")),
        url: non_empty(row.get("url")),
        metadata,
        session_id: non_empty(row.get("session_id")),
        created_at: parse_timestamp(&required(row, "created_at")?)?,
    })
}

fn session_from_row(row: &Row) -> Result<FeedSession> {
    let raw_type = required(row, "search_type")?;
    Ok(FeedSession {
        id: required(row, "id")?,
        user_id: required(row, "user_id")?,
        title: required(row, "title")?,
        search_type: SearchType::parse(&raw_type).unwrap_or_default(),
        preferences: parse_preferences(&required(row, "preferences")?)?,
        created_at: parse_timestamp(&required(row, "created_at")?)?,
    })
}

const ITEM_COLUMNS: &str = "i.id AS id, i.user_id AS user_id, i.item_type AS item_type,
     i.title AS title, i.summary AS summary, i.url AS url, i.metadata AS metadata,
     i.session_id AS session_id, i.created_at AS created_at";

const SESSION_COLUMNS: &str = "s.id AS id, s.user_id AS user_id, s.title AS title,
     s.search_type AS search_type, s.preferences AS preferences, s.created_at AS created_at";

#[async_trait]
impl FeedStore for Neo4jFeedStore {
    async fn resolve_user(&self, token: &str) -> Result<Option<UserId>> {
        let rows = self
            .rows(
                query("MATCH (u:User {api_token: $token}) RETURN u.id AS id LIMIT 1")
                    .param("token", token.to_string()),
            )
            .await?;
        Ok(rows.first().and_then(|row| row.get::<String>("id")))
    }

    async fn profile(&self, user_id: &str) -> Result<Option<Profile>> {
        let rows = self
            .rows(
                query(
                    "MATCH (u:User {id: $id})
                     RETURN u.profile_text AS profile_text,
                            u.last_feed_generated_at AS last_generated,
                            u.preferences AS preferences",
                )
                .param("id", user_id.to_string()),
            )
            .await?;

        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let last_feed_generated_at = match non_empty(row.get("last_generated")) {
            Some(raw) => Some(parse_timestamp(&raw)?),
            None => None,
        };
        let preferences = match non_empty(row.get("preferences")) {
            Some(raw) => Some(parse_preferences(&raw)?),
            None => None,
        };
        Ok(Some(Profile {
            profile_text: non_empty(row.get("profile_text")),
            last_feed_generated_at,
            preferences,
        }))
    }

    async fn save_profile_text(&self, user_id: &str, text: &str, at: DateTime<Utc>) -> Result<()> {
        self.graph
            .run(
                query(
                    "MERGE (u:User {id: $id})
                     SET u.profile_text = $text, u.last_feed_generated_at = $at",
                )
                .param("id", user_id.to_string())
                .param("text", text.to_string())
                .param("at", at.to_rfc3339()),
            )
            .await?;
        Ok(())
    }

    async fn save_preferences(&self, user_id: &str, preferences: &SearchPreferences) -> Result<()> {
        let json = serde_json::to_string(preferences)
            .map_err(|e| FeedError::Persistence(e.to_string()))?;
        self.graph
            .run(
                query("MERGE (u:User {id: $id}) SET u.preferences = $preferences")
                    .param("id", user_id.to_string())
                    .param("preferences", json),
            )
            .await?;
        Ok(())
    }

    async fn profile_sources(&self, user_id: &str) -> Result<Vec<ProfileSource>> {
        let rows = self
            .rows(
                query(
                    "MATCH (s:ProfileSource {user_id: $user_id})
                     RETURN s.url AS url, s.profile_type AS profile_type, s.keywords AS keywords
                     ORDER BY s.position",
                )
                .param("user_id", user_id.to_string()),
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| ProfileSource {
                url: non_empty(row.get("url")),
                profile_type: SourceKind::parse(&row.get::<String>("profile_type").unwrap_or_default()),
                keywords: non_empty(row.get("keywords")),
            })
            .collect())
    }

    async fn replace_profile_sources(&self, user_id: &str, sources: &[ProfileSource]) -> Result<()> {
        let txn = self.graph.start_txn().await?;
        let outcome = write_sources(&txn, user_id, sources).await;
        finish_txn(txn, outcome).await
    }

    async fn delete_unsessioned_items(&self, user_id: &str) -> Result<usize> {
        let rows = self
            .rows(query(DELETE_UNSESSIONED).param("user_id", user_id.to_string()))
            .await?;
        let deleted = rows
            .first()
            .and_then(|row| row.get::<i64>("deleted"))
            .unwrap_or(0);
        Ok(deleted.max(0) as usize)
    }

    async fn bulk_insert(&self, items: &[FeedItem]) -> Result<()> {
        let txn = self.graph.start_txn().await?;
        let mut outcome = Ok(());
        for item in items {
            if let Err(e) = txn.run(insert_item_query(item)).await {
                outcome = Err(e.into());
                break;
            }
        }
        finish_txn(txn, outcome).await
    }

    async fn update_last_generated(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.graph
            .run(
                query(TOUCH_LAST_GENERATED)
                    .param("id", user_id.to_string())
                    .param("at", at.to_rfc3339()),
            )
            .await?;
        Ok(())
    }

    async fn replace_current_feed(
        &self,
        user_id: &str,
        items: &[FeedItem],
        at: DateTime<Utc>,
    ) -> Result<()> {
        let txn = self.graph.start_txn().await?;
        let outcome = write_feed(&txn, user_id, items, at).await;
        finish_txn(txn, outcome).await?;
        debug!(user_id, items = items.len(), "Feed actual sustituido en Neo4j");
        Ok(())
    }

    async fn list_items(&self, user_id: &str, session_id: Option<&str>) -> Result<Vec<FeedItem>> {
        let cypher = format!(
            "MATCH (i:FeedItem {{user_id: $user_id, session_id: $session_id}})
             RETURN {ITEM_COLUMNS}
             ORDER BY i.created_at DESC"
        );
        let rows = self
            .rows(
                query(&cypher)
                    .param("user_id", user_id.to_string())
                    .param("session_id", session_id.unwrap_or_default().to_string()),
            )
            .await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn create_session(&self, session: &FeedSession) -> Result<()> {
        self.graph.run(create_session_query(session)?).await?;
        Ok(())
    }

    async fn create_session_snapshot(
        &self,
        session: &FeedSession,
        items: &[FeedItem],
        at: DateTime<Utc>,
    ) -> Result<()> {
        let txn = self.graph.start_txn().await?;
        let outcome = write_snapshot(&txn, session, items, at).await;
        finish_txn(txn, outcome).await?;
        debug!(
            user_id = %session.user_id,
            session_id = %session.id,
            items = items.len(),
            "Instantánea de sesión guardada en Neo4j"
        );
        Ok(())
    }

    async fn session(&self, user_id: &str, session_id: &str) -> Result<Option<FeedSession>> {
        let cypher = format!(
            "MATCH (s:FeedSession {{id: $id, user_id: $user_id}}) RETURN {SESSION_COLUMNS}"
        );
        let rows = self
            .rows(
                query(&cypher)
                    .param("id", session_id.to_string())
                    .param("user_id", user_id.to_string()),
            )
            .await?;
        rows.first().map(session_from_row).transpose()
    }

    async fn list_sessions(&self, user_id: &str) -> Result<Vec<FeedSession>> {
        let cypher = format!(
            "MATCH (s:FeedSession {{user_id: $user_id}})
             RETURN {SESSION_COLUMNS}
             ORDER BY s.created_at DESC"
        );
        let rows = self
            .rows(query(&cypher).param("user_id", user_id.to_string()))
            .await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn ping(&self) -> Result<()> {
        self.graph.run(query("RETURN 1")).await?;
        Ok(())
    }
}
