//! Line parsers.

use crate::types::Usage;
use crate::utils::json_path::{PathMapper, Segment};
use serde_json::Value;
use std::fmt;

/// Result of parsing one raw line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedLine {
    pub content: Option<String>,
    pub done: bool,
    /// Backend-reported failure carried inside the stream.
    pub error: Option<String>,
    pub usage: Option<Usage>,
}

impl ParsedLine {
    /// Line with nothing to emit (keep-alives, comments, role-only frames).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn done() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }
}

/// A line that could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedLine {
    pub reason: String,
}

impl fmt::Display for MalformedLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// `parse_line(raw) -> {content?, done}`
pub trait LineParser: Send + Sync {
    fn parse_line(&self, raw: &str) -> Result<ParsedLine, MalformedLine>;

    /// Whether a blank line is a frame separator (not counted as input).
    fn skips_blank_lines(&self) -> bool {
        true
    }
}

fn malformed(reason: impl Into<String>) -> MalformedLine {
    MalformedLine {
        reason: reason.into(),
    }
}

fn extract_text(value: &Value, path: &[Segment]) -> Option<String> {
    match PathMapper::get_segments(value, path)? {
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// Server-sent-events framing used by chat-completions style APIs.
#[derive(Debug, Clone)]
pub struct SseLineParser {
    prefix: String,
    done_signal: String,
    delta_path: Vec<Segment>,
    error_path: Vec<Segment>,
}

impl SseLineParser {
    pub const DEFAULT_DELTA_PATH: &'static str = "choices.0.delta.content";

    /// Parser extracting the delta at `delta_path`.
    pub fn new(delta_path: &str) -> Result<Self, MalformedLine> {
        Ok(Self {
            prefix: "data:".to_string(),
            done_signal: "[DONE]".to_string(),
            delta_path: PathMapper::parse(delta_path).map_err(|e| malformed(e.to_string()))?,
            error_path: vec![
                Segment::Key("error".to_string()),
                Segment::Key("message".to_string()),
            ],
        })
    }
}

impl Default for SseLineParser {
    fn default() -> Self {
        Self {
            prefix: "data:".to_string(),
            done_signal: "[DONE]".to_string(),
            delta_path: vec![
                Segment::Key("choices".to_string()),
                Segment::Index(0),
                Segment::Key("delta".to_string()),
                Segment::Key("content".to_string()),
            ],
            error_path: vec![
                Segment::Key("error".to_string()),
                Segment::Key("message".to_string()),
            ],
        }
    }
}

impl LineParser for SseLineParser {
    fn parse_line(&self, raw: &str) -> Result<ParsedLine, MalformedLine> {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(':') {
            return Ok(ParsedLine::empty());
        }
        // other SSE fields carry no payload for us
        if line.starts_with("event:") || line.starts_with("id:") || line.starts_with("retry:") {
            return Ok(ParsedLine::empty());
        }
        let payload = line
            .strip_prefix(&self.prefix)
            .ok_or_else(|| malformed("missing data: prefix"))?
            .trim_start();
        if payload == self.done_signal {
            return Ok(ParsedLine::done());
        }
        let value: Value =
            serde_json::from_str(payload).map_err(|e| malformed(format!("invalid JSON: {}", e)))?;
        if let Some(err) = extract_text(&value, &self.error_path) {
            return Ok(ParsedLine {
                error: Some(err),
                ..ParsedLine::default()
            });
        }
        let usage = value.get("usage").and_then(|u| {
            Some(Usage {
                prompt_tokens: u.get("prompt_tokens").and_then(Value::as_u64),
                completion_tokens: u.get("completion_tokens").and_then(Value::as_u64),
            })
            .filter(|u| u.total().is_some())
        });
        Ok(ParsedLine {
            content: extract_text(&value, &self.delta_path).filter(|s| !s.is_empty()),
            done: false,
            error: None,
            usage,
        })
    }
}

/// One JSON object per line, as emitted by local servers and inference binaries.
#[derive(Debug, Clone)]
pub struct JsonLinesParser {
    content_path: Vec<Segment>,
    done_field: String,
}

impl JsonLinesParser {
    /// Objects of the form `{"content": "...", "done": false}`.
    pub fn flat() -> Self {
        Self {
            content_path: vec![Segment::Key("content".to_string())],
            done_field: "done".to_string(),
        }
    }

    /// Content nested at `content_path`, e.g. `message.content`.
    pub fn with_content_path(content_path: &str) -> Result<Self, MalformedLine> {
        Ok(Self {
            content_path: PathMapper::parse(content_path).map_err(|e| malformed(e.to_string()))?,
            done_field: "done".to_string(),
        })
    }
}

impl Default for JsonLinesParser {
    fn default() -> Self {
        Self::flat()
    }
}

impl LineParser for JsonLinesParser {
    fn parse_line(&self, raw: &str) -> Result<ParsedLine, MalformedLine> {
        let line = raw.trim();
        if line.is_empty() {
            return Ok(ParsedLine::empty());
        }
        let value: Value =
            serde_json::from_str(line).map_err(|e| malformed(format!("invalid JSON: {}", e)))?;
        let obj = value
            .as_object()
            .ok_or_else(|| malformed("expected a JSON object"))?;
        if let Some(Value::String(err)) = obj.get("error") {
            return Ok(ParsedLine {
                error: Some(err.clone()),
                ..ParsedLine::default()
            });
        }
        let done = obj
            .get(&self.done_field)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let usage = if done {
            let u = Usage {
                prompt_tokens: obj.get("prompt_eval_count").and_then(Value::as_u64),
                completion_tokens: obj.get("eval_count").and_then(Value::as_u64),
            };
            u.total().map(|_| u)
        } else {
            None
        };
        Ok(ParsedLine {
            content: extract_text(&value, &self.content_path).filter(|s| !s.is_empty()),
            done,
            error: None,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_delta_done_and_comments() {
        let p = SseLineParser::default();
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(p.parse_line(line).unwrap(), ParsedLine::content("Hel"));
        assert_eq!(p.parse_line("data: [DONE]").unwrap(), ParsedLine::done());
        assert_eq!(p.parse_line(": keep-alive").unwrap(), ParsedLine::empty());
        assert_eq!(p.parse_line("event: message").unwrap(), ParsedLine::empty());
        // role-only frame
        let role = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(p.parse_line(role).unwrap(), ParsedLine::empty());
    }

    #[test]
    fn test_sse_malformed_and_error_frames() {
        let p = SseLineParser::default();
        assert!(p.parse_line("data: {not json").is_err());
        assert!(p.parse_line("garbage").is_err());
        let err = p
            .parse_line(r#"data: {"error":{"message":"overloaded"}}"#)
            .unwrap();
        assert_eq!(err.error.as_deref(), Some("overloaded"));
    }

    #[test]
    fn test_sse_custom_delta_path() {
        let p = SseLineParser::new("delta.text").unwrap();
        let parsed = p.parse_line(r#"data:{"delta":{"text":"x"}}"#).unwrap();
        assert_eq!(parsed.content.as_deref(), Some("x"));
    }

    #[test]
    fn test_json_lines_flat_and_nested() {
        let flat = JsonLinesParser::flat();
        let parsed = flat.parse_line(r#"{"content":"tok","done":false}"#).unwrap();
        assert_eq!(parsed.content.as_deref(), Some("tok"));
        assert!(!parsed.done);
        assert!(flat.parse_line(r#"{"content":"","done":true}"#).unwrap().done);
        assert!(flat.parse_line("[1,2]").is_err());

        let nested = JsonLinesParser::with_content_path("message.content").unwrap();
        let last = nested
            .parse_line(r#"{"message":{"content":"!"},"done":true,"prompt_eval_count":3,"eval_count":5}"#)
            .unwrap();
        assert_eq!(last.content.as_deref(), Some("!"));
        assert!(last.done);
        assert_eq!(last.usage.and_then(|u| u.total()), Some(8));
    }
}
