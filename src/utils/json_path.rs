//! Dotted path access into JSON values.
//!
//! Used by the stream parsers to pull deltas out of backend frames
//! (`choices.0.delta.content`, `message.content`) and by the workflow engine
//! to resolve variable references (`result.items[1].name`).
//!
//! Supported segment forms:
//! - object keys: `a.b.c`
//! - bracket indexes: `choices[0].delta`
//! - dot indexes: `choices.0.delta`
//! - leading `$.` is ignored

use serde_json::Value;

/// Path mapper error
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathMapperError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// One resolved path component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Path mapper for extracting values from JSON using dot-notation paths
pub struct PathMapper;

impl PathMapper {
    /// Split a path into segments, rejecting empty parts and malformed brackets.
    pub fn parse(path: &str) -> Result<Vec<Segment>, PathMapperError> {
        let normalized = path.trim().trim_start_matches("$.");
        if normalized.is_empty() {
            return Err(PathMapperError::InvalidPath("empty path".to_string()));
        }

        let mut segments = Vec::new();
        for part in normalized.split('.') {
            if part.is_empty() {
                return Err(PathMapperError::InvalidPath(path.to_string()));
            }
            let (key, mut rest) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };
            if !key.is_empty() {
                match key.parse::<usize>() {
                    Ok(idx) => segments.push(Segment::Index(idx)),
                    Err(_) => segments.push(Segment::Key(key.to_string())),
                }
            }
            while !rest.is_empty() {
                let close = rest
                    .find(']')
                    .ok_or_else(|| PathMapperError::InvalidPath(path.to_string()))?;
                let idx = rest[1..close]
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| PathMapperError::InvalidPath(path.to_string()))?;
                segments.push(Segment::Index(idx));
                rest = &rest[close + 1..];
                if !rest.is_empty() && !rest.starts_with('[') {
                    return Err(PathMapperError::InvalidPath(path.to_string()));
                }
            }
        }
        Ok(segments)
    }

    /// Walk pre-parsed segments.
    pub fn get_segments<'a>(obj: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
        let mut current = obj;
        for seg in segments {
            current = match (seg, current) {
                (Segment::Key(k), Value::Object(map)) => map.get(k)?,
                (Segment::Index(i), Value::Array(arr)) => arr.get(*i)?,
                (Segment::Index(i), Value::Object(map)) => map.get(&i.to_string())?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Get value from JSON using dot-notation path (supports array indexing)
    ///
    /// Examples:
    /// - "choices[0].delta.content"
    /// - "choices.0.delta.content"
    /// - "message.content"
    pub fn get_path<'a>(obj: &'a Value, path: &str) -> Option<&'a Value> {
        let segments = Self::parse(path).ok()?;
        Self::get_segments(obj, &segments)
    }

    /// Get string value from path (non-string scalars are rendered as JSON)
    pub fn get_string(obj: &Value, path: &str) -> Option<String> {
        Self::get_path(obj, path).and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => serde_json::to_string(other).ok(),
        })
    }
}
