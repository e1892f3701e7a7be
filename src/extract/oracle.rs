//! Generation-oracle extraction: a bounded LLM call that returns a
//! JSON IR, parsed permissively and handed to the critic as open
//! candidates.
//!
//! Parse failures are not errors: the deterministic stages still
//! produce a usable IR, so a malformed oracle response just degrades
//! to empty output with a warning.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::oracle::{Generator, OracleError};

use super::{CandidateEntity, CandidateRelation, Candidates};

/// Maximum tokens requested for an extraction call.
const EXTRACTION_MAX_TOKENS: u32 = 1024;

/// Default confidence when the oracle omits one.
const DEFAULT_CONFIDENCE: f64 = 0.8;

/// System prompt for the extraction call.
const EXTRACTION_PROMPT: &str = "\
Extract durable facts from the user's message as a JSON object.
Schema:
{
  \"entities\": [{\"id\": \"lowercase_slug\", \"name\": \"...\", \"type\": \"Person|Location|Organization|Event|Preference|Other\", \"confidence\": 0.0}],
  \"relations\": [{\"source\": \"entity_id\", \"target\": \"entity_id\", \"type\": \"FRIEND_OF|LIVES_IN|FROM|LIKES|DISLIKES|WORKS_AT|PARENT_OF|RELATED_TO|...\", \"confidence\": 0.0}]
}
The speaker is the entity with id \"user\". Only extract facts stated in
the message. Be conservative: omit anything uncertain. Output ONLY the
JSON object, no other text. If nothing is worth extracting, output
{\"entities\": [], \"relations\": []}.

Message:
";

/// Wire shape of one oracle entity (open strings, lenient defaults).
#[derive(Debug, Deserialize)]
struct WireEntity {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    is_user: bool,
}

/// Wire shape of one oracle relation.
#[derive(Debug, Deserialize)]
struct WireRelation {
    #[serde(default)]
    source: String,
    #[serde(default)]
    target: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    weight: Option<f64>,
    #[serde(default)]
    desc: Option<String>,
}

/// Wire shape of the whole oracle response.
#[derive(Debug, Default, Deserialize)]
struct WireIr {
    #[serde(default)]
    entities: Vec<WireEntity>,
    #[serde(default)]
    relations: Vec<WireRelation>,
}

/// Run the oracle extractor with a hard deadline.
///
/// Returns the candidates and the oracle confidence: the max entity or
/// relation confidence when anything was extracted, `0.0` otherwise.
///
/// # Errors
///
/// Returns an error only for transport-level failures (unreachable
/// provider, deadline elapsed); malformed responses degrade to empty.
pub async fn extract(
    generator: &dyn Generator,
    text: &str,
    timeout: Duration,
) -> Result<(Candidates, f64), OracleError> {
    let prompt = format!("{EXTRACTION_PROMPT}{text}");

    let response = tokio::time::timeout(
        timeout,
        generator.generate(&prompt, EXTRACTION_MAX_TOKENS),
    )
    .await
    .map_err(|_| OracleError::Timeout(timeout))??;

    Ok(parse_response(&response))
}

/// Parse an oracle response, salvaging the JSON object from any
/// surrounding prose. Unparseable responses yield empty candidates.
pub fn parse_response(response: &str) -> (Candidates, f64) {
    let trimmed = response.trim();
    let json_text = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    };

    let wire: WireIr = match serde_json::from_str(json_text) {
        Ok(wire) => wire,
        Err(err) => {
            let preview: String = response.chars().take(200).collect();
            warn!(
                error = %err,
                preview,
                "failed to parse oracle extraction response"
            );
            return (Candidates::default(), 0.0);
        }
    };

    let mut confidence: f64 = 0.0;
    let mut out = Candidates::default();

    for entity in wire.entities {
        let entity_confidence = entity.confidence.unwrap_or(DEFAULT_CONFIDENCE);
        confidence = confidence.max(entity_confidence);
        out.entities.push(CandidateEntity {
            id: entity.id,
            name: entity.name,
            kind: entity.kind.unwrap_or_else(|| "Other".to_owned()),
            confidence: entity_confidence,
            is_user: entity.is_user,
            attrs: serde_json::Map::new(),
        });
    }
    for relation in wire.relations {
        let relation_confidence = relation.confidence.unwrap_or(DEFAULT_CONFIDENCE);
        confidence = confidence.max(relation_confidence);
        out.relations.push(CandidateRelation {
            source_id: relation.source,
            target_id: relation.target,
            kind: relation.kind.unwrap_or_else(|| "RELATED_TO".to_owned()),
            confidence: relation_confidence,
            weight: relation.weight,
            desc: relation.desc,
        });
    }

    if out.entities.is_empty() && out.relations.is_empty() {
        confidence = 0.0;
    }

    debug!(
        entities = out.entities.len(),
        relations = out.relations.len(),
        "oracle extraction parsed"
    );
    (out, confidence)
}
