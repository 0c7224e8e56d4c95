//! Interpreting completions and request ids

use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("completion is not a JSON object")]
    NotJson,
    #[error("missing field {0}")]
    Missing(String),
    #[error("field {field} is not an integer: {value}")]
    NotInteger { field: String, value: String },
    #[error("field {field} = {value} is outside {min}..={max}")]
    OutOfRange { field: String, value: i64, min: i64, max: i64 },
}

/// Extract a JSON object from a completion.
///
/// Models sometimes wrap JSON in prose or code fences even in JSON mode:
/// 1. Direct parse
/// 2. Inside a ```json (or bare ```) fence
/// 3. First `{` to last `}`
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();

    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() {
            return Some(v);
        }
    }

    let fenced = if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        after.find("```").map(|end| &after[..end])
    } else if let Some(start) = trimmed.find("```\n") {
        let after = &trimmed[start + 4..];
        after.find("```").map(|end| &after[..end])
    } else {
        None
    };
    if let Some(block) = fenced {
        if let Ok(v) = serde_json::from_str::<Value>(block.trim()) {
            if v.is_object() {
                return Some(v);
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(v) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                if v.is_object() {
                    return Some(v);
                }
            }
        }
    }

    None
}

/// An integer in `min..=max`. Accepts integral floats (`4.0`) and numeric
/// strings (`"4"`), which models produce now and then.
fn bounded_int(field: &str, value: &Value, min: i64, max: i64) -> Result<u8, ParseError> {
    let not_integer = || ParseError::NotInteger {
        field: field.to_string(),
        value: value.to_string(),
    };
    let n = match value {
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i,
            (None, Some(f)) if f.fract() == 0.0 && f.abs() < 1e9 => f as i64,
            _ => return Err(not_integer()),
        },
        Value::String(s) => s.trim().parse::<i64>().map_err(|_| not_integer())?,
        _ => return Err(not_integer()),
    };
    if !(min..=max).contains(&n) {
        return Err(ParseError::OutOfRange {
            field: field.to_string(),
            value: n,
            min,
            max,
        });
    }
    Ok(n as u8)
}

/// Per-topic relevance (1-5) from a filter completion shaped like
/// `{"economy": {"relevance": 4}, ...}`. A bare number per topic is also
/// accepted. Each topic parses independently.
pub fn parse_relevance(content: &str, topics: &[String]) -> Result<BTreeMap<String, Result<u8, ParseError>>, ParseError> {
    let json = extract_json(content).ok_or(ParseError::NotJson)?;
    Ok(topics
        .iter()
        .map(|topic| {
            let score = match json.get(topic) {
                None => Err(ParseError::Missing(topic.clone())),
                Some(Value::Object(inner)) => match inner.get("relevance") {
                    Some(v) => bounded_int(&format!("{}.relevance", topic), v, 1, 5),
                    None => Err(ParseError::Missing(format!("{}.relevance", topic))),
                },
                Some(v) => bounded_int(topic, v, 1, 5),
            };
            (topic.clone(), score)
        })
        .collect())
}

/// Stance score (1-10) and optional reasoning from a score completion
/// shaped like `{"stance_score": 7, "reasoning": "..."}`.
pub fn parse_stance(content: &str) -> Result<(u8, Option<String>), ParseError> {
    let json = extract_json(content).ok_or(ParseError::NotJson)?;
    let raw = json
        .get("stance_score")
        .ok_or_else(|| ParseError::Missing("stance_score".to_string()))?;
    let score = bounded_int("stance_score", raw, 1, 10)?;
    let reasoning = json
        .get("reasoning")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    Ok((score, reasoning))
}

pub fn filter_custom_id(unit_id: i64) -> String {
    format!("unit_{}", unit_id)
}

pub fn parse_filter_custom_id(custom_id: &str) -> Option<i64> {
    custom_id.strip_prefix("unit_")?.parse().ok()
}

/// `score_<unit>_<0|1>`, the suffix recording whether reasoning was asked
/// for.
pub fn score_custom_id(unit_id: i64, with_reasoning: bool) -> String {
    format!("score_{}_{}", unit_id, u8::from(with_reasoning))
}

pub fn parse_score_custom_id(custom_id: &str) -> Option<(i64, bool)> {
    let rest = custom_id.strip_prefix("score_")?;
    let (id, flag) = rest.rsplit_once('_')?;
    let with_reasoning = match flag {
        "0" => false,
        "1" => true,
        _ => return None,
    };
    Some((id.parse().ok()?, with_reasoning))
}
