//! Modelos de dominio: categorías del feed, preferencias de búsqueda,
//! metadatos por categoría y elementos persistidos.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

/// Identificador del usuario propietario del feed.
pub type UserId = String;

/// Las cuatro categorías fijas de contenido.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Publications,
    Patents,
    FundingOpportunities,
    TrendingScienceNews,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Publications,
        Category::Patents,
        Category::FundingOpportunities,
        Category::TrendingScienceNews,
    ];

    /// Clave del bucket en el JSON devuelto por el modelo.
    pub fn key(self) -> &'static str {
        match self {
            Self::Publications => "publications",
            Self::Patents => "patents",
            Self::FundingOpportunities => "funding_opportunities",
            Self::TrendingScienceNews => "trending_science_news",
        }
    }

    /// Valor de `item_type` con el que se persiste cada elemento.
    pub fn item_type(self) -> &'static str {
        match self {
            Self::Publications => "publication",
            Self::Patents => "patent",
            Self::FundingOpportunities => "funding_opportunity",
            Self::TrendingScienceNews => "trending_science_news",
        }
    }

    pub fn from_item_type(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.item_type() == s)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

fn enabled() -> bool {
    true
}

/// Interruptores por categoría. Un campo omitido equivale a "activado".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryToggles {
    #[serde(default = "enabled")]
    pub publications: bool,
    #[serde(default = "enabled")]
    pub patents: bool,
    #[serde(default = "enabled")]
    pub funding_opportunities: bool,
    #[serde(default = "enabled")]
    pub trending_science_news: bool,
}

impl Default for CategoryToggles {
    fn default() -> Self {
        Self {
            publications: true,
            patents: true,
            funding_opportunities: true,
            trending_science_news: true,
        }
    }
}

#[cfg(test)]
impl CategoryToggles {
    /// Activa únicamente las categorías indicadas.
    pub fn only(categories: &[Category]) -> Self {
        Self {
            publications: categories.contains(&Category::Publications),
            patents: categories.contains(&Category::Patents),
            funding_opportunities: categories.contains(&Category::FundingOpportunities),
            trending_science_news: categories.contains(&Category::TrendingScienceNews),
        }
    }
}

impl CategoryToggles {
    pub fn is_enabled(&self, category: Category) -> bool {
        match category {
            Category::Publications => self.publications,
            Category::Patents => self.patents,
            Category::FundingOpportunities => self.funding_opportunities,
            Category::TrendingScienceNews => self.trending_science_news,
        }
    }

    pub fn enabled(&self) -> Vec<Category> {
        Category::ALL
            .into_iter()
            .filter(|c| self.is_enabled(*c))
            .collect()
    }
}

/// Ventana temporal de búsqueda.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeRange {
    PastMonth,
    PastThreeMonths,
    #[default]
    PastSixMonths,
    PastYear,
}

impl TimeRange {
    pub fn months(self) -> u32 {
        match self {
            Self::PastMonth => 1,
            Self::PastThreeMonths => 3,
            Self::PastSixMonths => 6,
            Self::PastYear => 12,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::PastMonth => "past month",
            Self::PastThreeMonths => "past 3 months",
            Self::PastSixMonths => "past 6 months",
            Self::PastYear => "past 12 months",
        }
    }

    /// Las noticias nunca miran más atrás de tres meses.
    pub fn for_news(self) -> Self {
        if self.months() > 3 {
            Self::PastThreeMonths
        } else {
            self
        }
    }
}

/// Nivel de impacto mínimo exigido al contenido.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactLevel {
    #[default]
    Any,
    High,
    Breakthrough,
}

fn default_items_per_category() -> u8 {
    SearchPreferences::DEFAULT_ITEMS
}

/// Acepta cualquier entero y lo acota a `1..=MAX_ITEMS`.
fn deserialize_items_per_category<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = i64::deserialize(deserializer)?;
    let clamped = raw.clamp(1, i64::from(SearchPreferences::MAX_ITEMS));
    Ok(clamped as u8)
}

/// Modificadores opcionales de la búsqueda (palabras clave, categorías, etc.).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPreferences {
    #[serde(default)]
    pub keywords: Option<String>,
    #[serde(default)]
    pub categories: CategoryToggles,
    #[serde(
        default = "default_items_per_category",
        deserialize_with = "deserialize_items_per_category"
    )]
    pub items_per_category: u8,
    #[serde(default)]
    pub time_range: TimeRange,
    #[serde(default)]
    pub impact_level: ImpactLevel,
}

impl Default for SearchPreferences {
    fn default() -> Self {
        Self {
            keywords: None,
            categories: CategoryToggles::default(),
            items_per_category: Self::DEFAULT_ITEMS,
            time_range: TimeRange::default(),
            impact_level: ImpactLevel::default(),
        }
    }
}

impl SearchPreferences {
    pub const DEFAULT_ITEMS: u8 = 4;
    pub const MAX_ITEMS: u8 = 10;

    /// Palabras clave sin espacios sobrantes, o `None` si están vacías.
    pub fn keywords(&self) -> Option<&str> {
        self.keywords
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    pub fn item_count(&self) -> u8 {
        self.items_per_category.clamp(1, Self::MAX_ITEMS)
    }
}

// --- Metadatos específicos por categoría ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublicationMeta {
    #[serde(default)]
    pub authors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatentMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patent_number: Option<String>,
    #[serde(default)]
    pub inventors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FundingMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuing_agency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding_amount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eligible_regions: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewsMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Metadatos de un elemento; la forma depende de su categoría.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemMetadata {
    Publication(PublicationMeta),
    Patent(PatentMeta),
    Funding(FundingMeta),
    News(NewsMeta),
}

impl ItemMetadata {
    pub fn to_json(&self) -> Value {
        let value = match self {
            Self::Publication(m) => serde_json::to_value(m),
            Self::Patent(m) => serde_json::to_value(m),
            Self::Funding(m) => serde_json::to_value(m),
            Self::News(m) => serde_json::to_value(m),
        };
        // Structs planos de Strings: la serialización no puede fallar.
        value.unwrap_or(Value::Null)
    }

    /// Decodifica el JSON persistido; la categoría decide la forma esperada.
    pub fn from_json(category: Category, value: Value) -> serde_json::Result<Self> {
        Ok(match category {
            Category::Publications => Self::Publication(serde_json::from_value(value)?),
            Category::Patents => Self::Patent(serde_json::from_value(value)?),
            Category::FundingOpportunities => Self::Funding(serde_json::from_value(value)?),
            Category::TrendingScienceNews => Self::News(serde_json::from_value(value)?),
        })
    }
}

impl Serialize for ItemMetadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Publication(m) => m.serialize(serializer),
            Self::Patent(m) => m.serialize(serializer),
            Self::Funding(m) => m.serialize(serializer),
            Self::News(m) => m.serialize(serializer),
        }
    }
}

/// Un registro normalizado, todavía sin usuario ni sesión.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedRecord {
    pub title: String,
    pub summary: Option<String>,
    pub url: Option<String>,
    pub metadata: ItemMetadata,
}

/// Resultado normalizado: sólo contiene las categorías activadas.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FeedPayload {
    buckets: BTreeMap<Category, Vec<FeedRecord>>,
}

impl FeedPayload {
    pub fn insert(&mut self, category: Category, records: Vec<FeedRecord>) {
        self.buckets.insert(category, records);
    }

    pub fn get(&self, category: Category) -> Option<&[FeedRecord]> {
        self.buckets.get(&category).map(Vec::as_slice)
    }

    pub fn total(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    /// Convierte el payload en filas listas para insertar.
    pub fn to_items(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Vec<FeedItem> {
        self.buckets
            .iter()
            .flat_map(|(category, records)| {
                records.iter().map(move |record| FeedItem {
                    id: Uuid::new_v4().to_string(),
                    user_id: user_id.to_string(),
                    item_type: *category,
                    title: record.title.clone(),
                    summary: record.summary.clone(),
                    url: record.url.clone(),
                    metadata: record.metadata.clone(),
                    session_id: session_id.map(str::to_string),
                    created_at,
                })
            })
            .collect()
    }
}

#[cfg(test)]
impl FeedPayload {
    pub fn categories(&self) -> impl Iterator<Item = Category> + '_ {
        self.buckets.keys().copied()
    }
}

fn serialize_item_type<S: Serializer>(category: &Category, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(category.item_type())
}

/// Fila persistida del feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedItem {
    pub id: String,
    pub user_id: UserId,
    #[serde(serialize_with = "serialize_item_type")]
    pub item_type: Category,
    pub title: String,
    pub summary: Option<String>,
    pub url: Option<String>,
    pub metadata: ItemMetadata,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Perfil almacenado del investigador.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile {
    pub profile_text: Option<String>,
    pub last_feed_generated_at: Option<DateTime<Utc>>,
    pub preferences: Option<SearchPreferences>,
}

impl Profile {
    /// Texto del perfil, ignorando perfiles vacíos.
    pub fn text(&self) -> Option<&str> {
        self.profile_text
            .as_deref()
            .filter(|t| !t.trim().is_empty())
    }
}

/// Origen de una URL enviada por el usuario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Linkedin,
    GoogleScholar,
    Company,
    Website,
    Orcid,
    #[default]
    Other,
    Keywords,
}

impl SourceKind {
    pub const ALL: [SourceKind; 7] = [
        SourceKind::Linkedin,
        SourceKind::GoogleScholar,
        SourceKind::Company,
        SourceKind::Website,
        SourceKind::Orcid,
        SourceKind::Other,
        SourceKind::Keywords,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linkedin => "linkedin",
            Self::GoogleScholar => "google_scholar",
            Self::Company => "company",
            Self::Website => "website",
            Self::Orcid => "orcid",
            Self::Other => "other",
            Self::Keywords => "keywords",
        }
    }

    pub fn parse(s: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .unwrap_or_default()
    }
}

/// URL o palabras clave que alimentan la generación del perfil.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSource {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub profile_type: SourceKind,
    #[serde(default)]
    pub keywords: Option<String>,
}

impl ProfileSource {
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }

    pub fn keywords(&self) -> Option<&str> {
        self.keywords
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

/// Tipo de búsqueda que originó una sesión.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    #[default]
    ProfileFeed,
    KeywordSearch,
}

impl SearchType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProfileFeed => "profile_feed",
            Self::KeywordSearch => "keyword_search",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "profile_feed" => Some(Self::ProfileFeed),
            "keyword_search" | "keyword-search" => Some(Self::KeywordSearch),
            _ => None,
        }
    }
}

/// Instantánea con nombre de una ejecución del pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSession {
    pub id: String,
    pub user_id: UserId,
    pub title: String,
    pub search_type: SearchType,
    pub preferences: SearchPreferences,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn omitted_category_flags_default_to_enabled() {
        let toggles: CategoryToggles = serde_json::from_value(json!({ "patents": false })).unwrap();
        assert!(toggles.publications);
        assert!(!toggles.patents);
        assert!(toggles.funding_opportunities);
        assert!(toggles.trending_science_news);

        let prefs: SearchPreferences = serde_json::from_value(json!({})).unwrap();
        assert_eq!(prefs.categories, CategoryToggles::default());
        assert_eq!(prefs.item_count(), 4);
    }

    #[test]
    fn preferences_accept_camel_case_and_null_keywords() {
        let prefs: SearchPreferences = serde_json::from_value(json!({
            "keywords": null,
            "itemsPerCategory": 40,
            "timeRange": "past_year",
            "impactLevel": "high"
        }))
        .unwrap();
        assert_eq!(prefs.keywords(), None);
        assert_eq!(prefs.item_count(), SearchPreferences::MAX_ITEMS);
        assert_eq!(prefs.time_range, TimeRange::PastYear);
        assert_eq!(prefs.time_range.for_news(), TimeRange::PastThreeMonths);
        assert_eq!(prefs.impact_level, ImpactLevel::High);
    }

    #[test]
    fn out_of_range_item_counts_are_clamped_on_read() {
        for (raw, expected) in [(300, 10), (-1, 1), (0, 1), (7, 7)] {
            let prefs: SearchPreferences =
                serde_json::from_value(json!({ "itemsPerCategory": raw })).unwrap();
            assert_eq!(prefs.items_per_category, expected, "itemsPerCategory = {raw}");
        }
    }

    #[test]
    fn metadata_survives_json_for_every_category() {
        let samples = vec![
            (Category::Publications, ItemMetadata::Publication(PublicationMeta {
                authors: vec!["Ada Lovelace".into(), "Alan Turing".into()],
            })),
            (Category::Patents, ItemMetadata::Patent(PatentMeta {
                patent_number: Some("US1234567".into()),
                inventors: vec!["Grace Hopper".into()],
            })),
            (Category::FundingOpportunities, ItemMetadata::Funding(FundingMeta {
                issuing_agency: Some("ARC".into()),
                funding_amount: Some("$500,000".into()),
                deadline: Some("2027-03-01".into()),
                eligible_regions: Some("Australia, International".into()),
            })),
            (Category::TrendingScienceNews, ItemMetadata::News(NewsMeta {
                source: Some("Nature News".into()),
            })),
        ];

        for (category, meta) in samples {
            let decoded = ItemMetadata::from_json(category, meta.to_json()).unwrap();
            assert_eq!(decoded, meta);
        }
    }

    #[test]
    fn funding_metadata_omits_missing_fields() {
        let meta = ItemMetadata::Funding(FundingMeta {
            deadline: Some("2027-01-01".into()),
            ..Default::default()
        });
        assert_eq!(meta.to_json(), json!({ "deadline": "2027-01-01" }));
    }

    #[test]
    fn items_carry_user_session_and_item_type() {
        let mut payload = FeedPayload::default();
        payload.insert(
            Category::FundingOpportunities,
            vec![FeedRecord {
                title: "Grant".into(),
                summary: None,
                url: None,
                metadata: ItemMetadata::Funding(FundingMeta::default()),
            }],
        );
        payload.insert(Category::Patents, Vec::new());

        let items = payload.to_items("user-1", Some("session-9"), Utc::now());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].user_id, "user-1");
        assert_eq!(items[0].session_id.as_deref(), Some("session-9"));

        let json = serde_json::to_value(&items[0]).unwrap();
        assert_eq!(json["item_type"], "funding_opportunity");
        assert_eq!(Category::from_item_type("funding_opportunity"), Some(Category::FundingOpportunities));
    }
}
