//! Scoring stage: summary + retrieved evidence in, [`Assessment`] out.

use oppmatch_core::{
    clamp_score, truncate_chars, truncate_list, Assessment, EvidenceCitation, ExtractedSummary,
    ProcessingError, Stage, TextLimits,
};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::backend::{GenerativeModel, InferenceError, Prompt};
use crate::knowledge::Passage;
use crate::parse::{extract_json_object, list_field, number_field, text_field, ParseError};
use crate::{into_processing_error, CallOptions};

pub const EXCERPT_CHARS: usize = 300;

pub const NO_EVIDENCE_RATIONALE: &str = "No company capability evidence was found in the knowledge base \
(retrieval disabled or returned no passages), so no fit can be supported. Scored 0.0.";

/// The honest result when there is nothing to score against.
pub fn no_evidence_assessment(summary: &ExtractedSummary) -> Assessment {
    Assessment {
        match_score: 0.0,
        rationale: NO_EVIDENCE_RATIONALE.to_string(),
        citations: Vec::new(),
        opportunity_required_skills: summary.required_skills.clone(),
        company_skills: Vec::new(),
    }
}

const SCORING_SYSTEM: &str = "You assess how well a company's documented capabilities fit a government \
contracting opportunity. Base the score only on the numbered evidence passages. \
Respond with a single JSON object and nothing else.";

pub fn build_scoring_prompt(summary: &ExtractedSummary, passages: &[Passage]) -> Prompt {
    let mut user = String::from("## Opportunity\n");
    for (label, value) in [
        ("Title", &summary.title),
        ("Agency", &summary.agency),
        ("NAICS", &summary.naics_code),
        ("Set-aside", &summary.set_aside),
        ("Requirements", &summary.requirements),
        ("Scope", &summary.scope),
        ("Technical specs", &summary.technical_specs),
    ] {
        if !value.is_empty() {
            user.push_str(&format!("{label}: {value}\n"));
        }
    }
    if !summary.required_skills.is_empty() {
        user.push_str(&format!("Required skills: {}\n", summary.required_skills.join(", ")));
    }
    user.push_str("\n## Company capability evidence\n");
    for (i, passage) in passages.iter().enumerate() {
        user.push_str(&format!("[{}] ({})\n{}\n\n", i + 1, passage.document_name, passage.text.trim()));
    }
    user.push_str(
        "Return JSON: {\"match_score\": number between 0 and 1, \"rationale\": str, \
         \"citations\": [passage numbers that support the rationale], \
         \"opportunity_required_skills\": [str], \"company_skills\": [str]}.\n\
         Cite only the numbered passages above.",
    );
    Prompt {
        system: SCORING_SYSTEM.to_string(),
        user,
    }
}

fn passage_index(reference: &JsonValue, passages: &[Passage]) -> Option<usize> {
    let by_number = |n: u64| {
        let n = usize::try_from(n).ok()?;
        (1..=passages.len()).contains(&n).then(|| n - 1)
    };
    let by_name = |name: &str| {
        let name = name.trim();
        passages
            .iter()
            .position(|p| p.document_name.eq_ignore_ascii_case(name) || p.source_uri == name)
    };
    match reference {
        JsonValue::Number(n) => by_number(n.as_u64()?),
        JsonValue::String(s) => {
            let digits = s.trim().trim_start_matches('[').trim_end_matches(']').trim();
            match digits.parse::<u64>() {
                Ok(n) => by_number(n),
                Err(_) => by_name(s.as_str()),
            }
        }
        JsonValue::Object(_) => ["passage", "index", "id"]
            .iter()
            .find_map(|f| reference.get(*f))
            .and_then(|v| passage_index(v, passages))
            .or_else(|| {
                ["document_name", "document", "source"]
                    .iter()
                    .find_map(|f| reference.get(*f).and_then(JsonValue::as_str))
                    .and_then(by_name)
            }),
        _ => None,
    }
}

/// Map the model's citation references onto retrieved passages. References to
/// anything that was not retrieved are dropped; duplicates keep first position.
pub fn map_citations(references: &[JsonValue], passages: &[Passage]) -> Vec<EvidenceCitation> {
    let mut seen = Vec::new();
    let mut citations = Vec::new();
    for reference in references {
        match passage_index(reference, passages) {
            Some(index) if !seen.contains(&index) => {
                seen.push(index);
                let passage = &passages[index];
                citations.push(EvidenceCitation {
                    document_name: passage.document_name.clone(),
                    excerpt: truncate_chars(passage.text.trim(), EXCERPT_CHARS),
                    source_uri: passage.source_uri.clone(),
                });
            }
            Some(_) => {}
            None => warn!(%reference, "model cited evidence that was not retrieved; dropped"),
        }
    }
    citations
}

/// Scores above 1 are read as percentages before clamping.
fn normalize_score(raw: f64) -> f64 {
    if raw > 1.0 && raw <= 100.0 {
        clamp_score(raw / 100.0)
    } else {
        clamp_score(raw)
    }
}

pub fn parse_scoring(
    output: &str,
    summary: &ExtractedSummary,
    passages: &[Passage],
    limits: &TextLimits,
) -> Result<Assessment, ParseError> {
    let value = extract_json_object(output)?;
    let match_score = normalize_score(number_field(&value, "match_score")?);
    let rationale = truncate_chars(&text_field(&value, "rationale"), limits.field_chars);
    if rationale.is_empty() {
        return Err(ParseError::MissingField("rationale"));
    }
    let references = value
        .get("citations")
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default();
    let mut required = list_field(&value, "opportunity_required_skills");
    if required.is_empty() {
        required = summary.required_skills.clone();
    }
    Ok(Assessment {
        match_score,
        rationale,
        citations: map_citations(&references, passages),
        opportunity_required_skills: truncate_list(required, limits),
        company_skills: truncate_list(list_field(&value, "company_skills"), limits),
    })
}

/// Scoring stage. Without evidence no model call is made and the score is 0.
pub async fn score_opportunity(
    model: &dyn GenerativeModel,
    summary: &ExtractedSummary,
    passages: &[Passage],
    limits: &TextLimits,
    options: &CallOptions,
) -> Result<Assessment, ProcessingError> {
    if passages.is_empty() {
        debug!("no evidence retrieved; scoring short-circuited");
        return Ok(no_evidence_assessment(summary));
    }
    let prompt = build_scoring_prompt(summary, passages);
    oppmatch_storage::retry_with_backoff(&options.backoff, options.timeout, |_| {
        let prompt = &prompt;
        async move {
            let text = model.generate(prompt).await?;
            parse_scoring(&text, summary, passages, limits)
                .map_err(|e| InferenceError::UnusableOutput(e.to_string()))
        }
    })
    .await
    .map_err(|e| into_processing_error(Stage::Scoring, e))
}
