//! Adaptador de persistencia: contrato del almacén y backend en memoria.
//!
//! El backend Neo4j vive en `neo4j_client`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{FeedError, Result};
use crate::models::{FeedItem, FeedSession, Profile, ProfileSource, SearchPreferences, UserId};

#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Resuelve el usuario asociado a un bearer token.
    async fn resolve_user(&self, token: &str) -> Result<Option<UserId>>;

    async fn profile(&self, user_id: &str) -> Result<Option<Profile>>;

    /// Guarda el texto del perfil y marca la hora de generación.
    async fn save_profile_text(&self, user_id: &str, text: &str, at: DateTime<Utc>) -> Result<()>;

    async fn save_preferences(&self, user_id: &str, preferences: &SearchPreferences) -> Result<()>;

    async fn profile_sources(&self, user_id: &str) -> Result<Vec<ProfileSource>>;

    async fn replace_profile_sources(&self, user_id: &str, sources: &[ProfileSource]) -> Result<()>;

    /// Borra el feed actual (elementos sin sesión). Devuelve cuántos borró.
    async fn delete_unsessioned_items(&self, user_id: &str) -> Result<usize>;

    async fn bulk_insert(&self, items: &[FeedItem]) -> Result<()>;

    async fn update_last_generated(&self, user_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Sustituye el feed actual: borrado, inserción y marca de tiempo.
    ///
    /// La implementación por defecto encadena las tres operaciones sin
    /// atomicidad; los backends la sobrescriben para hacerlas atómicas.
    async fn replace_current_feed(
        &self,
        user_id: &str,
        items: &[FeedItem],
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.delete_unsessioned_items(user_id).await?;
        if !items.is_empty() {
            self.bulk_insert(items).await?;
        }
        self.update_last_generated(user_id, at).await
    }

    /// Elementos del feed actual (`None`) o de una sesión concreta.
    async fn list_items(&self, user_id: &str, session_id: Option<&str>) -> Result<Vec<FeedItem>>;

    async fn create_session(&self, session: &FeedSession) -> Result<()>;

    /// Guarda una sesión con sus elementos y marca la hora de generación.
    ///
    /// Igual que `replace_current_feed`, la versión por defecto no es atómica
    /// y los backends la sobrescriben: si falla, no queda ni la sesión ni
    /// ninguno de sus elementos.
    async fn create_session_snapshot(
        &self,
        session: &FeedSession,
        items: &[FeedItem],
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.create_session(session).await?;
        if !items.is_empty() {
            self.bulk_insert(items).await?;
        }
        self.update_last_generated(&session.user_id, at).await
    }

    async fn session(&self, user_id: &str, session_id: &str) -> Result<Option<FeedSession>>;

    async fn list_sessions(&self, user_id: &str) -> Result<Vec<FeedSession>>;

    async fn ping(&self) -> Result<()>;
}

#[derive(Default)]
struct MemoryState {
    tokens: HashMap<String, UserId>,
    profiles: HashMap<UserId, Profile>,
    sources: HashMap<UserId, Vec<ProfileSource>>,
    items: Vec<FeedItem>,
    sessions: Vec<FeedSession>,
}

impl MemoryState {
    fn delete_unsessioned(&mut self, user_id: &str) -> usize {
        let before = self.items.len();
        self.items
            .retain(|item| item.user_id != user_id || item.session_id.is_some());
        before - self.items.len()
    }
}

/// Almacén en memoria, para desarrollo local y tests.
#[derive(Default)]
pub struct MemoryFeedStore {
    state: Mutex<MemoryState>,
}

impl MemoryFeedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra un usuario accesible con `token`.
    pub fn with_user(self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        if let Ok(mut state) = self.state.lock() {
            let user_id = user_id.into();
            state.profiles.entry(user_id.clone()).or_default();
            state.tokens.insert(token.into(), user_id);
        }
        self
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| FeedError::Persistence("estado en memoria envenenado".to_string()))
    }
}

#[async_trait]
impl FeedStore for MemoryFeedStore {
    async fn resolve_user(&self, token: &str) -> Result<Option<UserId>> {
        Ok(self.state()?.tokens.get(token).cloned())
    }

    async fn profile(&self, user_id: &str) -> Result<Option<Profile>> {
        Ok(self.state()?.profiles.get(user_id).cloned())
    }

    async fn save_profile_text(&self, user_id: &str, text: &str, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state()?;
        let profile = state.profiles.entry(user_id.to_string()).or_default();
        profile.profile_text = Some(text.to_string());
        profile.last_feed_generated_at = Some(at);
        Ok(())
    }

    async fn save_preferences(&self, user_id: &str, preferences: &SearchPreferences) -> Result<()> {
        let mut state = self.state()?;
        state
            .profiles
            .entry(user_id.to_string())
            .or_default()
            .preferences = Some(preferences.clone());
        Ok(())
    }

    async fn profile_sources(&self, user_id: &str) -> Result<Vec<ProfileSource>> {
        Ok(self
            .state()?
            .sources
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_profile_sources(&self, user_id: &str, sources: &[ProfileSource]) -> Result<()> {
        self.state()?
            .sources
            .insert(user_id.to_string(), sources.to_vec());
        Ok(())
    }

    async fn delete_unsessioned_items(&self, user_id: &str) -> Result<usize> {
        Ok(self.state()?.delete_unsessioned(user_id))
    }

    async fn bulk_insert(&self, items: &[FeedItem]) -> Result<()> {
        self.state()?.items.extend_from_slice(items);
        Ok(())
    }

    async fn update_last_generated(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.state()?
            .profiles
            .entry(user_id.to_string())
            .or_default()
            .last_feed_generated_at = Some(at);
        Ok(())
    }

    async fn replace_current_feed(
        &self,
        user_id: &str,
        items: &[FeedItem],
        at: DateTime<Utc>,
    ) -> Result<()> {
        // Las tres operaciones bajo el mismo cerrojo.
        let mut state = self.state()?;
        state.delete_unsessioned(user_id);
        state.items.extend_from_slice(items);
        state
            .profiles
            .entry(user_id.to_string())
            .or_default()
            .last_feed_generated_at = Some(at);
        Ok(())
    }

    async fn list_items(&self, user_id: &str, session_id: Option<&str>) -> Result<Vec<FeedItem>> {
        Ok(self
            .state()?
            .items
            .iter()
            .filter(|item| item.user_id == user_id && item.session_id.as_deref() == session_id)
            .cloned()
            .collect())
    }

    async fn create_session(&self, session: &FeedSession) -> Result<()> {
        self.state()?.sessions.push(session.clone());
        Ok(())
    }

    async fn create_session_snapshot(
        &self,
        session: &FeedSession,
        items: &[FeedItem],
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state()?;
        if state
            .sessions
            .iter()
            .any(|s| s.user_id == session.user_id && s.id == session.id)
        {
            return Err(FeedError::Validation(format!(
                "la sesión '{}' ya existe y es inmutable",
                session.id
            )));
        }
        state.sessions.push(session.clone());
        state.items.extend_from_slice(items);
        state
            .profiles
            .entry(session.user_id.clone())
            .or_default()
            .last_feed_generated_at = Some(at);
        Ok(())
    }

    async fn session(&self, user_id: &str, session_id: &str) -> Result<Option<FeedSession>> {
        Ok(self
            .state()?
            .sessions
            .iter()
            .find(|s| s.user_id == user_id && s.id == session_id)
            .cloned())
    }

    async fn list_sessions(&self, user_id: &str) -> Result<Vec<FeedSession>> {
        let mut sessions: Vec<FeedSession> = self
            .state()?
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn ping(&self) -> Result<()> {
        self.state().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Category, ItemMetadata, NewsMeta};

    fn item(user: &str, title: &str, session: Option<&str>) -> FeedItem {
        FeedItem {
            id: format!("{user}-{title}"),
            user_id: user.to_string(),
            item_type: Category::TrendingScienceNews,
            title: title.to_string(),
            summary: None,
            url: None,
            metadata: ItemMetadata::News(NewsMeta::default()),
            session_id: session.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn resolves_seeded_token() {
        let store = MemoryFeedStore::new().with_user("tok", "u1");
        assert_eq!(store.resolve_user("tok").await.unwrap().as_deref(), Some("u1"));
        assert_eq!(store.resolve_user("other").await.unwrap(), None);
        assert_eq!(store.profile("u1").await.unwrap(), Some(Profile::default()));
    }

    #[tokio::test]
    async fn replace_keeps_session_snapshots_and_other_users() {
        let store = MemoryFeedStore::new();
        store
            .bulk_insert(&[
                item("u1", "old", None),
                item("u1", "snapshot", Some("s1")),
                item("u2", "neighbour", None),
            ])
            .await
            .unwrap();

        let at = Utc::now();
        store
            .replace_current_feed("u1", &[item("u1", "fresh", None)], at)
            .await
            .unwrap();

        let current = store.list_items("u1", None).await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].title, "fresh");
        assert_eq!(store.list_items("u1", Some("s1")).await.unwrap().len(), 1);
        assert_eq!(store.list_items("u2", None).await.unwrap().len(), 1);
        assert_eq!(
            store.profile("u1").await.unwrap().unwrap().last_feed_generated_at,
            Some(at)
        );
    }

    #[tokio::test]
    async fn interleaved_delete_then_insert_duplicates_items() {
        // Secuencia no atómica de dos refrescos concurrentes: ambos borran
        // antes de que ninguno inserte, y el feed queda duplicado.
        let store = MemoryFeedStore::new();
        let run_a = [item("u1", "a1", None), item("u1", "a2", None)];
        let run_b = [item("u1", "b1", None), item("u1", "b2", None)];

        store.delete_unsessioned_items("u1").await.unwrap();
        store.delete_unsessioned_items("u1").await.unwrap();
        store.bulk_insert(&run_a).await.unwrap();
        store.bulk_insert(&run_b).await.unwrap();

        assert_eq!(store.list_items("u1", None).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn concurrent_atomic_replaces_leave_exactly_one_run() {
        let store = MemoryFeedStore::new();
        let run_a = [item("u1", "a1", None), item("u1", "a2", None)];
        let run_b = [item("u1", "b1", None), item("u1", "b2", None)];
        let at = Utc::now();

        let (ra, rb) = tokio::join!(
            store.replace_current_feed("u1", &run_a, at),
            store.replace_current_feed("u1", &run_b, at),
        );
        ra.unwrap();
        rb.unwrap();

        let titles: Vec<String> = store
            .list_items("u1", None)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.title)
            .collect();
        assert_eq!(titles.len(), 2);
        let prefix = &titles[0][..1];
        assert!(titles.iter().all(|t| t.starts_with(prefix)));
    }

    fn session(id: &str) -> FeedSession {
        FeedSession {
            id: id.into(),
            user_id: "u1".into(),
            title: "Feed".into(),
            search_type: crate::models::SearchType::ProfileFeed,
            preferences: SearchPreferences::default(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn session_snapshot_is_written_whole_and_only_once() {
        let store = MemoryFeedStore::new();
        store.bulk_insert(&[item("u1", "current", None)]).await.unwrap();
        let at = Utc::now();

        store
            .create_session_snapshot(
                &session("s1"),
                &[item("u1", "a", Some("s1")), item("u1", "b", Some("s1"))],
                at,
            )
            .await
            .unwrap();
        assert_eq!(store.list_items("u1", Some("s1")).await.unwrap().len(), 2);
        assert_eq!(store.list_items("u1", None).await.unwrap().len(), 1);
        assert_eq!(
            store.profile("u1").await.unwrap().unwrap().last_feed_generated_at,
            Some(at)
        );

        let err = store
            .create_session_snapshot(&session("s1"), &[item("u1", "c", Some("s1"))], Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Validation(_)));
        assert_eq!(store.list_items("u1", Some("s1")).await.unwrap().len(), 2);
        assert_eq!(store.list_sessions("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sessions_are_listed_newest_first() {
        let store = MemoryFeedStore::new();
        let older = FeedSession {
            id: "s-old".into(),
            user_id: "u1".into(),
            title: "Old".into(),
            search_type: crate::models::SearchType::ProfileFeed,
            preferences: SearchPreferences::default(),
            created_at: Utc::now() - chrono::Duration::hours(1),
        };
        let newer = FeedSession {
            id: "s-new".into(),
            created_at: Utc::now(),
            ..older.clone()
        };
        store.create_session(&older).await.unwrap();
        store.create_session(&newer).await.unwrap();

        let ids: Vec<_> = store
            .list_sessions("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["s-new", "s-old"]);
        assert!(store.session("u2", "s-new").await.unwrap().is_none());
    }
}
