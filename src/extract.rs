//! Extracción del objeto JSON embebido en la respuesta libre del modelo.
//!
//! Los modelos de búsqueda no siempre respetan la instrucción "sólo JSON":
//! la respuesta puede traer un bloque de razonamiento, un bloque de código
//! markdown o prosa alrededor del objeto. Las reglas se aplican en este orden:
//!
//!   1. `SeekingReasoningEnd`: si aparece `</think>`, se descarta todo hasta él.
//!   2. `SeekingFence`: si hay un bloque ```` ```json ```` (o ```` ``` ````) cerrado,
//!      se toma su interior.
//!   3. `SeekingBraces`: en otro caso, del primer `{` al último `}`, salvo que
//!      el texto empiece por `[` (lista de nivel superior).
//!
//! No es un parser: no equilibra llaves.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{FeedError, Result};

const REASONING_END: &str = "</think>";
const JSON_FENCE: &str = "```json";
const FENCE: &str = "```";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractState {
    SeekingReasoningEnd,
    SeekingFence,
    SeekingBraces,
    Done,
}

/// Regla que produjo el candidato final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionRule {
    /// El texto (sin razonamiento) se devuelve tal cual.
    Verbatim,
    Fenced,
    Braces,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extraction<'a> {
    pub candidate: &'a str,
    pub reasoning_stripped: bool,
    pub rule: ExtractionRule,
}

/// Aísla el candidato a JSON dentro de `raw`. Nunca falla; el parseo lo
/// hace quien llama.
pub fn extract_json_candidate(raw: &str) -> Extraction<'_> {
    let mut text = raw.trim();
    let mut reasoning_stripped = false;
    let mut rule = ExtractionRule::Verbatim;
    let mut state = ExtractState::SeekingReasoningEnd;

    loop {
        state = match state {
            ExtractState::SeekingReasoningEnd => {
                if let Some(pos) = text.find(REASONING_END) {
                    text = text[pos + REASONING_END.len()..].trim();
                    reasoning_stripped = true;
                }
                ExtractState::SeekingFence
            }
            ExtractState::SeekingFence => match fenced_interior(text) {
                Some(inner) => {
                    text = inner;
                    rule = ExtractionRule::Fenced;
                    // Un bloque con etiqueta distinta de `json` deja la etiqueta dentro.
                    if text.starts_with('{') {
                        ExtractState::Done
                    } else {
                        ExtractState::SeekingBraces
                    }
                }
                None => ExtractState::SeekingBraces,
            },
            // Una lista de nivel superior se deja entera para que el parseo la rechace.
            ExtractState::SeekingBraces if text.starts_with('[') => ExtractState::Done,
            ExtractState::SeekingBraces => {
                if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
                    if end > start && (start > 0 || end + 1 < text.len()) {
                        text = &text[start..=end];
                        rule = ExtractionRule::Braces;
                    }
                }
                ExtractState::Done
            }
            ExtractState::Done => break,
        };
    }

    Extraction {
        candidate: text,
        reasoning_stripped,
        rule,
    }
}

/// Interior de un bloque de código cerrado, priorizando ```` ```json ````.
fn fenced_interior(text: &str) -> Option<&str> {
    let opener = if text.contains(JSON_FENCE) {
        JSON_FENCE
    } else if text.contains(FENCE) {
        FENCE
    } else {
        return None;
    };

    let start = text.find(opener)? + opener.len();
    let len = text[start..].find(FENCE)?;
    if len == 0 {
        return None;
    }
    Some(text[start..start + len].trim())
}

/// Elimina únicamente el bloque de razonamiento (para respuestas en prosa).
pub fn strip_reasoning(raw: &str) -> &str {
    let text = raw.trim();
    match text.find(REASONING_END) {
        Some(pos) => text[pos + REASONING_END.len()..].trim(),
        None => text,
    }
}

/// Extrae y parsea estrictamente el objeto JSON de nivel superior.
pub fn parse_payload(raw: &str) -> Result<Map<String, Value>> {
    let extraction = extract_json_candidate(raw);
    debug!(
        rule = ?extraction.rule,
        reasoning_stripped = extraction.reasoning_stripped,
        candidate_len = extraction.candidate.len(),
        "Candidato JSON extraído"
    );

    match serde_json::from_str::<Value>(extraction.candidate) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => {
            warn!("La respuesta del modelo no es un objeto JSON");
            Err(FeedError::malformed(
                format!("se esperaba un objeto, se obtuvo {}", json_kind(&other)),
                raw,
            ))
        }
        Err(e) => {
            warn!(error = %e, "Fallo al parsear el JSON del modelo");
            Err(FeedError::malformed(e.to_string(), raw))
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "un booleano",
        Value::Number(_) => "un número",
        Value::String(_) => "una cadena",
        Value::Array(_) => "una lista",
        Value::Object(_) => "un objeto",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasoning_then_fence_yields_fence_interior() {
        let raw = "<think>weighing {options} and } stray braces</think>\n```json\n{\"publications\":[]}\n```\nHope this helps!";
        let extraction = extract_json_candidate(raw);
        assert_eq!(extraction.candidate, "{\"publications\":[]}");
        assert!(extraction.reasoning_stripped);
        assert_eq!(extraction.rule, ExtractionRule::Fenced);
    }

    #[test]
    fn bare_json_is_returned_trimmed() {
        let raw = "  \n{\"patents\": [{\"title\": \"x\"}]}\n ";
        let extraction = extract_json_candidate(raw);
        assert_eq!(extraction.candidate, raw.trim());
        assert_eq!(extraction.rule, ExtractionRule::Verbatim);
        assert!(!extraction.reasoning_stripped);
    }

    #[test]
    fn generic_fence_with_language_tag_falls_back_to_braces() {
        let raw = "Here you go:\n```JSON\n{\"a\": 1}\n```";
        assert_eq!(extract_json_candidate(raw).candidate, "{\"a\": 1}");

        let raw = "```\n{\"a\": 2}\n```";
        let extraction = extract_json_candidate(raw);
        assert_eq!(extraction.candidate, "{\"a\": 2}");
        assert_eq!(extraction.rule, ExtractionRule::Fenced);
    }

    #[test]
    fn prose_around_object_is_sliced_away() {
        let raw = "Sure! Here is the data: {\"a\": {\"b\": 1}} Let me know.";
        let extraction = extract_json_candidate(raw);
        assert_eq!(extraction.candidate, "{\"a\": {\"b\": 1}}");
        assert_eq!(extraction.rule, ExtractionRule::Braces);
    }

    #[test]
    fn unclosed_fence_still_slices_braces() {
        let raw = "```json\n{\"a\": 1}";
        assert_eq!(extract_json_candidate(raw).candidate, "{\"a\": 1}");
    }

    #[test]
    fn plain_prose_is_malformed_with_excerpt() {
        let raw = "I could not find anything relevant this week.";
        match parse_payload(raw) {
            Err(FeedError::MalformedResponse { excerpt, .. }) => assert_eq!(excerpt, raw),
            other => panic!("expected MalformedResponse, got {other:?}"),
        }
    }

    #[test]
    fn top_level_array_is_rejected() {
        let err = parse_payload("[{\"title\": \"x\"}]").unwrap_err();
        assert!(matches!(err, FeedError::MalformedResponse { .. }));
    }

    #[test]
    fn fenced_top_level_array_is_not_sliced() {
        let raw = "```json\n[{\"title\": \"x\", \"publications\": []}]\n```";
        let extraction = extract_json_candidate(raw);
        assert!(extraction.candidate.starts_with('['));
        assert!(matches!(
            parse_payload(raw),
            Err(FeedError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn excerpt_is_truncated_to_500_chars() {
        let raw = format!("{{ not json {}", "x".repeat(2_000));
        match parse_payload(&raw) {
            Err(FeedError::MalformedResponse { excerpt, .. }) => assert_eq!(excerpt.len(), 500),
            other => panic!("expected MalformedResponse, got {other:?}"),
        }
    }

    #[test]
    fn strip_reasoning_keeps_prose() {
        assert_eq!(strip_reasoning("<think>plan</think>\n\nDr. Jane Roe works on..."), "Dr. Jane Roe works on...");
        assert_eq!(strip_reasoning("  No reasoning here "), "No reasoning here");
    }
}
