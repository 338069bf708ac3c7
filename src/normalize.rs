//! Normalización del JSON del modelo a las categorías tipadas del feed.

use std::str::FromStr;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::models::{
    Category, CategoryToggles, FeedPayload, FeedRecord, FundingMeta, ItemMetadata, NewsMeta,
    PatentMeta, PublicationMeta,
};

/// Qué hacer con convocatorias cuyo plazo ya ha vencido.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FundingDeadlinePolicy {
    /// Se persisten tal cual las devuelve el modelo.
    #[default]
    Keep,
    /// Se descartan las que tengan un plazo `YYYY-MM-DD` igual o anterior a hoy.
    DropExpired,
}

impl FromStr for FundingDeadlinePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "keep" => Ok(Self::Keep),
            "drop_expired" => Ok(Self::DropExpired),
            other => Err(format!("Política de plazos no soportada: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NormalizeOptions {
    pub funding_policy: FundingDeadlinePolicy,
    pub today: NaiveDate,
}

/// Registro descartado durante la normalización.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRecord {
    pub category: Category,
    /// Posición en la lista del modelo; `None` si el bucket entero era inválido.
    pub index: Option<usize>,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub payload: FeedPayload,
    pub skipped: Vec<SkippedRecord>,
}

/// Reparte el JSON del modelo en las categorías activadas.
///
/// Una categoría activada pero ausente produce una lista vacía; una
/// desactivada nunca se escribe aunque el modelo la haya devuelto. Los
/// registros inservibles se descartan y se informan en `skipped` en lugar
/// de abortar la ejecución completa.
pub fn normalize(
    raw: &Map<String, Value>,
    enabled: &CategoryToggles,
    options: &NormalizeOptions,
) -> Normalized {
    let mut out = Normalized::default();

    for category in enabled.enabled() {
        let mut records = Vec::new();

        match raw.get(category.key()) {
            None | Some(Value::Null) => {}
            Some(Value::Array(entries)) => {
                for (index, entry) in entries.iter().enumerate() {
                    match normalize_record(category, entry) {
                        Ok(record) => records.push(record),
                        Err(reason) => out.skipped.push(SkippedRecord {
                            category,
                            index: Some(index),
                            reason,
                        }),
                    }
                }
            }
            Some(_) => out.skipped.push(SkippedRecord {
                category,
                index: None,
                reason: "el bucket no es una lista".to_string(),
            }),
        }

        if category == Category::FundingOpportunities
            && options.funding_policy == FundingDeadlinePolicy::DropExpired
        {
            records.retain(|record| match expired_deadline(record, options.today) {
                Some(deadline) => {
                    out.skipped.push(SkippedRecord {
                        category,
                        index: None,
                        reason: format!("plazo vencido ({deadline}): {}", record.title),
                    });
                    false
                }
                None => true,
            });
        }

        out.payload.insert(category, records);
    }

    for key in raw.keys() {
        let known = Category::ALL.iter().find(|c| c.key() == key);
        match known {
            Some(c) if !enabled.is_enabled(*c) => {
                info!(category = %c, "Categoría desactivada ignorada en la respuesta")
            }
            None => warn!(key = %key, "Clave desconocida en la respuesta del modelo"),
            _ => {}
        }
    }

    if !out.skipped.is_empty() {
        warn!(skipped = out.skipped.len(), "Registros descartados durante la normalización");
    }
    out
}

fn normalize_record(category: Category, entry: &Value) -> Result<FeedRecord, String> {
    let obj = entry
        .as_object()
        .ok_or_else(|| "el registro no es un objeto".to_string())?;

    let title = text_field(obj, "title").ok_or_else(|| "falta el título".to_string())?;

    let metadata = match category {
        Category::Publications => ItemMetadata::Publication(PublicationMeta {
            authors: list_field(obj, "authors"),
        }),
        Category::Patents => ItemMetadata::Patent(PatentMeta {
            patent_number: text_field(obj, "patent_number"),
            inventors: list_field(obj, "inventors"),
        }),
        Category::FundingOpportunities => ItemMetadata::Funding(FundingMeta {
            issuing_agency: text_field(obj, "issuing_agency"),
            funding_amount: text_field(obj, "funding_amount"),
            deadline: text_field(obj, "deadline"),
            eligible_regions: joined_field(obj, "eligible_regions"),
        }),
        Category::TrendingScienceNews => ItemMetadata::News(NewsMeta {
            source: text_field(obj, "source"),
        }),
    };

    Ok(FeedRecord {
        title,
        summary: text_field(obj, "summary"),
        url: text_field(obj, "url"),
        metadata,
    })
}

/// Cadena no vacía; los números se aceptan como texto (importes, números de patente).
fn text_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Lista de cadenas; un valor suelto cuenta como lista de un elemento.
fn list_field(obj: &Map<String, Value>, key: &str) -> Vec<String> {
    match obj.get(key) {
        Some(Value::Array(values)) => values
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn joined_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key) {
        Some(Value::Array(_)) => {
            let parts = list_field(obj, key);
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        _ => text_field(obj, key),
    }
}

fn expired_deadline(record: &FeedRecord, today: NaiveDate) -> Option<NaiveDate> {
    let ItemMetadata::Funding(meta) = &record.metadata else {
        return None;
    };
    let deadline = NaiveDate::parse_from_str(meta.deadline.as_deref()?, "%Y-%m-%d").ok()?;
    (deadline <= today).then_some(deadline)
}
