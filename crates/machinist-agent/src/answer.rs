use serde::{Deserialize, Serialize};

use machinist_core::error::{MachinistError, Result};

/// Where an answer primarily came from.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnswerOrigin {
    Manual,
    WebSearch,
    GeneralKnowledge,
    Mixed,
    #[default]
    None,
}

impl AnswerOrigin {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Manual => "Manual",
            Self::WebSearch => "Web search",
            Self::GeneralKnowledge => "General knowledge",
            Self::Mixed => "Mixed",
            Self::None => "None",
        }
    }
}

/// The validated structured result of a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredAnswer {
    /// The answer text shown to the user.
    pub answer: String,
    /// Ordered source identifiers (manual files, URLs) backing the answer.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Optional follow-up question to offer the user.
    #[serde(default)]
    pub follow_up: Option<String>,
    #[serde(default)]
    pub origin: AnswerOrigin,
}

impl StructuredAnswer {
    /// The fixed degraded result returned when a turn fails outright.
    pub fn fallback() -> Self {
        Self {
            answer: "I apologize, but I was unable to produce a reliable answer to \
                     that question. Please try rephrasing it."
                .to_string(),
            sources: vec![],
            confidence: 0.1,
            follow_up: Some("Could you rephrase the question, or name the machine model?".into()),
            origin: AnswerOrigin::None,
        }
    }
}

/// Enforces the structured-response contract. Fails closed: anything that
/// does not parse into a complete, in-range answer is rejected.
#[derive(Debug, Clone, Default)]
pub struct AnswerValidator;

impl AnswerValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate candidate output, applying heuristic repair first.
    pub fn validate(&self, candidate: &str) -> Result<StructuredAnswer> {
        let repaired = heuristic_repair(candidate);

        let answer: StructuredAnswer = serde_json::from_str(&repaired)
            .map_err(|e| MachinistError::Validation(format!("output is not valid JSON: {}", e)))?;

        if answer.answer.trim().is_empty() {
            return Err(MachinistError::Validation(
                "'answer' must be a non-empty string".into(),
            ));
        }
        if !answer.confidence.is_finite() || !(0.0..=1.0).contains(&answer.confidence) {
            return Err(MachinistError::Validation(format!(
                "'confidence' must be within [0, 1], got {}",
                answer.confidence
            )));
        }
        if let Some(follow_up) = &answer.follow_up {
            if follow_up.trim().is_empty() {
                return Err(MachinistError::Validation(
                    "'follow_up' must be omitted or non-empty".into(),
                ));
            }
        }

        Ok(answer)
    }
}

/// Apply heuristic repairs to model output before parsing.
/// - Strips markdown code fences
/// - Balances JSON braces
/// - Trims whitespace
pub fn heuristic_repair(output: &str) -> String {
    let mut result = strip_code_fences(output);
    result = result.trim().to_string();

    if result.starts_with('{') || result.starts_with('[') {
        result = balance_braces(&result);
    }

    result
}

/// Strip markdown code fences from text.
fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();

    // Try ```json ... ``` first
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    // Try ``` ... ```
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip optional language tag on same line
        let content_start = after.find('\n').map_or(0, |p| p + 1);
        let after = &after[content_start..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    trimmed.to_string()
}

/// Balance JSON braces/brackets by appending missing closers.
fn balance_braces(text: &str) -> String {
    let mut brace_depth: i32 = 0;
    let mut bracket_depth: i32 = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for ch in text.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match ch {
            '{' => brace_depth += 1,
            '}' => brace_depth -= 1,
            '[' => bracket_depth += 1,
            ']' => bracket_depth -= 1,
            _ => {}
        }
    }

    let mut result = text.to_string();
    for _ in 0..bracket_depth {
        result.push(']');
    }
    for _ in 0..brace_depth {
        result.push('}');
    }
    result
}
