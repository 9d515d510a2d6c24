//! Screening for market-derived signals.
//!
//! Odds and popularity must never reach features, training, or inference.
//! Any field whose name matches the pattern is a hard error.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::error::EngineError;

/// Name fragments that mark a market-derived field.
pub const FORBIDDEN_KEYWORDS: [&str; 6] = ["odds", "ninki", "popularity", "popular", "オッズ", "人気"];

static FORBIDDEN_PATTERN: OnceLock<Regex> = OnceLock::new();

fn pattern() -> &'static Regex {
    FORBIDDEN_PATTERN.get_or_init(|| {
        let alternatives: Vec<String> = FORBIDDEN_KEYWORDS.iter().map(|k| regex::escape(k)).collect();
        // Keywords are fixed literals, so the pattern always compiles.
        Regex::new(&format!("(?i)({})", alternatives.join("|"))).expect("static pattern")
    })
}

/// Check whether a single field name is forbidden.
pub fn is_forbidden(name: &str) -> bool {
    pattern().is_match(name)
}

/// Fail on the first forbidden field name.
///
/// `origin` names where the fields came from (file, request) for the error.
pub fn ensure_allowed<'a, I>(names: I, origin: &str) -> Result<(), EngineError>
where
    I: IntoIterator<Item = &'a str>,
{
    for name in names {
        if is_forbidden(name) {
            return Err(EngineError::ForbiddenInput {
                field: name.to_string(),
                origin: origin.to_string(),
            });
        }
    }
    Ok(())
}

/// Fail on the first forbidden key anywhere in a JSON tree, including keys
/// of objects nested inside arrays.
pub fn ensure_allowed_json(value: &Value, origin: &str) -> Result<(), EngineError> {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                ensure_allowed([key.as_str()], origin)?;
                ensure_allowed_json(nested, origin)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                ensure_allowed_json(item, origin)?;
            }
        }
        _ => {}
    }
    Ok(())
}
