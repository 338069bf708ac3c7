//! Construcción de los prompts que se envían a la API de búsqueda.
//!
//! Las tres llamadas (perfil, feed y búsqueda por palabras clave) comparten
//! el mismo pipeline; sólo cambia la plantilla (`PromptTemplate`).

use std::sync::LazyLock;

use chrono::{Months, NaiveDate};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::models::{
    Category, ImpactLevel, ProfileSource, SearchPreferences, SourceKind, TimeRange,
};

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().map(|p| Regex::new(p).unwrap()).collect()
}

static NAME_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)(?:Name|Called|Known as):\s*([^\n]+)",
        r"(?m)^([A-Z][a-z]+ [A-Z][a-z]+)",
        r"(?i)Dr\.?\s+([A-Z][a-z]+ [A-Z][a-z]+)",
    ])
});

static INSTITUTION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)(?:University|Institute|Research|Laboratory|Lab|College|School):\s*([^\n]+)",
        r"(?i)(University of [^,\n]+)",
        r"(?i)([A-Z][a-z]+ University)",
        r"(?i)\b(CSIRO|RMIT|MIT|Stanford|Harvard|Oxford|Cambridge)\b",
    ])
});

static COUNTRY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)(?:Country|Location|Based in|Located in):\s*([^\n]+)",
        r"(?i)(Australia|United States|Canada|United Kingdom|Germany|France|Japan|Singapore|New Zealand)",
        r"(?i)(Australian|American|Canadian|British|German|French|Japanese|Singaporean)",
    ])
});

static CITY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)(?:City|Location):\s*([^\n,]+)",
        r"(?i)(Melbourne|Sydney|Brisbane|Perth|Adelaide|Canberra|Auckland|Wellington)",
        r"(?i)(London|Boston|New York|San Francisco|Berlin|Paris|Tokyo|Singapore)",
    ])
});

static PROFILE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:research|field|area|focus|interest):\s*([^\n,]+)").unwrap()
});

fn first_capture(patterns: &[Regex], text: &str) -> Option<String> {
    patterns.iter().find_map(|re| {
        re.captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// `needle` aparece como palabra completa (o como frase, si lleva espacios).
fn mentions(haystack: &str, needle: &str) -> bool {
    if needle.contains(' ') {
        return haystack.contains(needle);
    }
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| word == needle)
}

fn mentions_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| mentions(haystack, n))
}

/// Identidad del investigador inferida del texto libre del perfil.
///
/// Es una extracción de mejor esfuerzo: si ningún patrón encaja el campo
/// queda vacío y la cláusula de exclusión correspondiente se omite.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearcherIdentity {
    pub name: Option<String>,
    pub institution: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
}

impl ResearcherIdentity {
    pub fn extract(profile_text: &str) -> Self {
        Self {
            name: first_capture(&NAME_PATTERNS, profile_text),
            institution: first_capture(&INSTITUTION_PATTERNS, profile_text),
            country: first_capture(&COUNTRY_PATTERNS, profile_text),
            city: first_capture(&CITY_PATTERNS, profile_text),
        }
    }

    pub fn has_exclusions(&self) -> bool {
        self.name.is_some() || self.institution.is_some()
    }

    /// Regiones de elegibilidad para financiación. `International` siempre está.
    pub fn eligible_regions(&self) -> Vec<&'static str> {
        let mut regions = vec!["International"];

        if let Some(country) = self.country.as_deref().map(str::to_lowercase) {
            let extra: &[&str] = if country.contains("australia") {
                &["Australia", "Asia-Pacific", "Commonwealth"]
            } else if country.contains("united states") || country.contains("american") {
                &["United States", "North America", "Americas"]
            } else if country.contains("canada") || country.contains("canadian") {
                &["Canada", "North America", "Commonwealth", "Americas"]
            } else if country.contains("united kingdom") || country.contains("british") {
                &["United Kingdom", "Europe", "Commonwealth", "EU"]
            } else if country.contains("germany") || country.contains("german") {
                &["Germany", "Europe", "EU"]
            } else if country.contains("singapore") {
                &["Singapore", "Asia-Pacific", "ASEAN"]
            } else {
                &[]
            };
            regions.extend_from_slice(extra);
        }

        if regions.len() == 1 {
            if let Some(institution) = self.institution.as_deref().map(str::to_lowercase) {
                let inst = institution.as_str();
                if mentions_any(inst, &["csiro", "university of melbourne", "university of sydney", "rmit", "anu", "unsw", "uq"]) {
                    regions.extend_from_slice(&["Australia", "Asia-Pacific", "Commonwealth"]);
                } else if mentions_any(inst, &["mit", "harvard", "stanford", "caltech"]) {
                    regions.extend_from_slice(&["United States", "North America", "Americas"]);
                } else if mentions_any(inst, &["oxford", "cambridge", "imperial college", "ucl"]) {
                    regions.extend_from_slice(&["United Kingdom", "Europe", "Commonwealth", "EU"]);
                }
            }
        }

        regions
    }
}

/// Etiquetas `research:`/`field:`/`focus:`... presentes en el perfil.
pub fn profile_tags(profile_text: &str) -> Vec<String> {
    PROFILE_TAG
        .captures_iter(profile_text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Plantilla de prompt; cada variante corresponde a un punto de entrada.
#[derive(Debug, Clone, Copy)]
pub enum PromptTemplate<'a> {
    Profile {
        sources: &'a [ProfileSource],
    },
    Feed {
        profile_text: &'a str,
        preferences: &'a SearchPreferences,
    },
    KeywordSearch {
        keywords: &'a str,
        preferences: &'a SearchPreferences,
    },
}

/// Prompt listo para enviar, junto con lo que se infirió al construirlo.
#[derive(Debug, Clone)]
pub struct BuiltPrompt {
    pub text: String,
    pub identity: ResearcherIdentity,
    pub eligible_regions: Vec<&'static str>,
    pub search_keywords: Vec<String>,
    /// Fecha más antigua aceptable para el contenido.
    pub cutoff: NaiveDate,
}

impl PromptTemplate<'_> {
    pub fn build(&self, today: NaiveDate) -> BuiltPrompt {
        match *self {
            PromptTemplate::Profile { sources } => build_profile_prompt(sources, today),
            PromptTemplate::Feed {
                profile_text,
                preferences,
            } => build_feed_prompt(profile_text, preferences, today),
            PromptTemplate::KeywordSearch {
                keywords,
                preferences,
            } => build_keyword_prompt(keywords, preferences, today),
        }
    }
}

const JSON_ONLY: &str =
    "Do not include any explanatory text, reasoning, or other content outside of this JSON object.";

fn cutoff_for(range: TimeRange, today: NaiveDate) -> NaiveDate {
    today
        .checked_sub_months(Months::new(range.months()))
        .unwrap_or(today)
}

fn age_limit(range: TimeRange) -> String {
    match range.months() {
        1 => "1 month".to_string(),
        m => format!("{m} months"),
    }
}

fn impact_guidance(level: ImpactLevel) -> Option<&'static str> {
    match level {
        ImpactLevel::Any => None,
        ImpactLevel::High => Some(
            "PRIORITISE high-impact content: top-tier journals, widely cited work, major funding agencies and established outlets.",
        ),
        ImpactLevel::Breakthrough => Some(
            "ONLY include breakthrough-level content: landmark results, flagship grants and front-page science news.",
        ),
    }
}

/// Instrucción de búsqueda para una categoría.
fn category_guidance(
    category: Category,
    prefs: &SearchPreferences,
    today: NaiveDate,
    regions: Option<&str>,
    topic: Option<&str>,
) -> String {
    let about = topic
        .map(|t| format!(" related to \"{t}\""))
        .unwrap_or_default();
    let range = prefs.time_range;

    match category {
        Category::Publications => format!(
            "PUBLICATIONS ({}): Research papers, journal articles, and preprints{about}. Include papers from journals, arxiv, research repositories.",
            range.label()
        ),
        Category::Patents => format!(
            "PATENTS ({}): Recently granted patents{about}. Include patents from patent databases and offices.",
            range.label()
        ),
        Category::FundingOpportunities => {
            let mut line = format!(
                "FUNDING (active with future deadlines): Grant opportunities{about} with application deadlines AFTER {today}. Only include grants that researchers can still apply for."
            );
            if let Some(regions) = regions {
                line.push_str(&format!(" Geographic eligibility: {regions}"));
            }
            line
        }
        Category::TrendingScienceNews => format!(
            "NEWS ({}): Science news, research announcements, university press releases, and articles about research developments{about}.",
            range.for_news().label()
        ),
    }
}

/// Ejemplo de registro que se muestra al modelo para cada categoría.
fn skeleton_entry(category: Category) -> Value {
    match category {
        Category::Publications => json!({
            "title": "Paper title",
            "authors": ["Author1", "Author2"],
            "summary": "Brief summary of the paper",
            "url": "https://journal.com/articles/direct-paper-link"
        }),
        Category::Patents => json!({
            "title": "Patent title",
            "patent_number": "US1234567",
            "inventors": ["Inventor1"],
            "summary": "Brief summary",
            "url": "https://example.com/patent"
        }),
        Category::FundingOpportunities => json!({
            "title": "Grant title",
            "issuing_agency": "Agency name",
            "funding_amount": "$X amount",
            "deadline": "YYYY-MM-DD",
            "eligible_regions": "Regions (must match researcher eligibility)",
            "summary": "Brief summary",
            "url": "https://example.com/grant"
        }),
        Category::TrendingScienceNews => json!({
            "title": "News title",
            "source": "Source name",
            "summary": "Brief summary",
            "url": "https://example.com/news"
        }),
    }
}

fn json_skeleton(categories: &[Category]) -> String {
    let skeleton: Map<String, Value> = categories
        .iter()
        .map(|c| (c.key().to_string(), Value::Array(vec![skeleton_entry(*c)])))
        .collect();
    serde_json::to_string_pretty(&Value::Object(skeleton)).unwrap_or_else(|_| "{}".to_string())
}

fn numbered(lines: &[String]) -> String {
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{}. {line}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_feed_prompt(
    profile_text: &str,
    prefs: &SearchPreferences,
    today: NaiveDate,
) -> BuiltPrompt {
    let identity = ResearcherIdentity::extract(profile_text);
    let eligible_regions = identity.eligible_regions();
    let regions = eligible_regions.join(", ");

    let mut search_keywords: Vec<String> = prefs.keywords().map(str::to_string).into_iter().collect();
    search_keywords.extend(profile_tags(profile_text));

    let keyword_context = if search_keywords.is_empty() {
        String::new()
    } else {
        format!("\n\nADDITIONAL SEARCH KEYWORDS: {}", search_keywords.join(", "))
    };

    let mut exclusions = String::new();
    if let Some(name) = &identity.name {
        exclusions.push_str(&format!("Content by \"{name}\". "));
    }
    if let Some(institution) = &identity.institution {
        exclusions.push_str(&format!("Content from \"{institution}\". "));
    }

    let categories = prefs.categories.enabled();
    let instructions: Vec<String> = categories
        .iter()
        .map(|c| category_guidance(*c, prefs, today, Some(&regions), None))
        .collect();
    let impact = impact_guidance(prefs.impact_level)
        .map(|g| format!("\n{g}\n"))
        .unwrap_or_default();

    let text = format!(
        "Find recent research content for this researcher. Return {count} items per category.

TODAY'S DATE: {today}

RESEARCHER: {profile}{keyword_context}

EXCLUDE: {exclusions}Content older than {age}.

FIND (recent content only):
{instructions}
{impact}
Return ONLY this JSON structure:
{skeleton}

{JSON_ONLY}",
        count = prefs.item_count(),
        today = today.format("%Y-%m-%d"),
        profile = profile_text.trim(),
        age = age_limit(prefs.time_range),
        instructions = numbered(&instructions),
        skeleton = json_skeleton(&categories),
    );

    BuiltPrompt {
        text,
        identity,
        eligible_regions,
        search_keywords,
        cutoff: cutoff_for(prefs.time_range, today),
    }
}

fn build_keyword_prompt(keywords: &str, prefs: &SearchPreferences, today: NaiveDate) -> BuiltPrompt {
    let keywords = keywords.trim();
    let categories = prefs.categories.enabled();
    let instructions: Vec<String> = categories
        .iter()
        .map(|c| category_guidance(*c, prefs, today, None, Some(keywords)))
        .collect();
    let impact = impact_guidance(prefs.impact_level)
        .map(|g| format!("\n{g}\n"))
        .unwrap_or_default();

    let text = format!(
        "Find recent research content related to these keywords: \"{keywords}\"

TODAY'S DATE: {today}

IMPORTANT: This is a pure keyword search. Do NOT consider any researcher profile or existing expertise. Focus ONLY on the provided keywords.

SEARCH FOCUS: {keywords}

FIND recent content in these categories:
{instructions}
{impact}
Return ONLY this JSON structure:
{skeleton}

Return {count} items per category. Focus on recent, relevant content related to \"{keywords}\".
{JSON_ONLY}",
        today = today.format("%Y-%m-%d"),
        instructions = numbered(&instructions),
        skeleton = json_skeleton(&categories),
        count = prefs.item_count(),
    );

    BuiltPrompt {
        text,
        identity: ResearcherIdentity::default(),
        eligible_regions: vec!["International"],
        search_keywords: vec![keywords.to_string()],
        cutoff: cutoff_for(prefs.time_range, today),
    }
}

fn source_heading(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::Linkedin => "LinkedIn Profile",
        SourceKind::GoogleScholar => "Google Scholar",
        SourceKind::Company => "Company/Institution",
        SourceKind::Website => "Personal Website",
        SourceKind::Orcid => "ORCID Profile",
        SourceKind::Other | SourceKind::Keywords => "Other Professional Profiles",
    }
}

fn build_profile_prompt(sources: &[ProfileSource], today: NaiveDate) -> BuiltPrompt {
    let keywords: Vec<String> = sources
        .iter()
        .filter(|s| s.profile_type == SourceKind::Keywords)
        .filter_map(|s| s.keywords().map(str::to_string))
        .collect();

    let mut text = String::from(
        "You are a world-class professional analyst tasked with creating a detailed profile of a leading expert in their field.

CRITICAL INSTRUCTIONS - URL-SPECIFIC ANALYSIS ONLY:

I will provide you with specific URLs associated with this professional. Your task is to extract and analyze information ONLY from the content available at these provided URLs.",
    );

    let mut groups: Vec<(&'static str, Vec<&str>)> = Vec::new();
    for source in sources {
        let Some(url) = source.url() else { continue };
        let heading = source_heading(source.profile_type);
        match groups.iter_mut().find(|(h, _)| *h == heading) {
            Some((_, urls)) => urls.push(url),
            None => groups.push((heading, vec![url])),
        }
    }
    let order = [
        "LinkedIn Profile",
        "Google Scholar",
        "Company/Institution",
        "Personal Website",
        "ORCID Profile",
        "Other Professional Profiles",
    ];
    groups.sort_by_key(|(heading, _)| order.iter().position(|h| h == heading));

    if !groups.is_empty() {
        text.push_str("\n\nURLS TO ANALYZE:\n\n");
        for (heading, urls) in &groups {
            text.push_str(heading);
            text.push_str(":\n");
            for url in urls {
                text.push_str(&format!("- {url}\n"));
            }
            text.push('\n');
        }
        text.push_str(
            "MANDATORY CONSTRAINTS:
- ONLY analyze information available at the specific URLs listed above
- DO NOT perform general web searches using the person's name
- DO NOT mix information from different people with similar names
- FOCUS exclusively on the content found at the provided URLs
- If any URL content is not accessible, clearly state that rather than searching elsewhere
- Base your analysis ONLY on what you can extract from these specific URLs\n\n",
        );
    } else {
        text.push_str("\n\n");
    }

    if !keywords.is_empty() {
        text.push_str(&format!(
            "FOCUS AREAS AND KEYWORDS:
The professional is particularly interested in these areas: {}

Use these keywords to guide what aspects of their profile to emphasize when analyzing the URL content.\n\n",
            keywords.join(", ")
        ));
    }

    text.push_str(
        "PROFILE GENERATION REQUIREMENTS:

Extract and analyze information from the provided URLs to create a comprehensive technical profile that includes:

1. **Current Professional Focus**: What specific problems, technologies, or research areas are they working on right now?
2. **Technical Expertise**: Specific tools, frameworks, methodologies, programming languages, or laboratory techniques
3. **Research Interests**: Detailed sub-fields, emerging areas, interdisciplinary connections
4. **Academic/Professional Background**: Education, current position, career progression as found in URLs
5. **Publications & Output**: Research papers, patents, projects mentioned in their profiles
6. **Industry Applications**: How their work translates to real-world applications or commercial potential
7. **Professional Network**: Collaborations, affiliations, or connections mentioned in their profiles

Generate a comprehensive professional profile of 500-700 words. Focus heavily on their current and recent work rather than just career history. Use specific technical terminology and include details that would help identify relevant recent publications, patents, funding opportunities, and industry news in their field.

Write this as a detailed research profile suitable for curating a personalized professional feed, not a general biography. Be specific about their expertise areas and current focus based on what you can extract from their URL content.",
    );

    BuiltPrompt {
        text,
        identity: ResearcherIdentity::default(),
        eligible_regions: Vec::new(),
        search_keywords: keywords,
        cutoff: today,
    }
}
