//! Shared stream framing for backend responses.
//!
//! ```text
//! bytes ──► lines ──► LineParser ──► text deltas
//!  (HTTP body or      (SSE or        (malformed lines counted;
//!   child stdout)      JSON-lines)     abort past threshold)
//! ```
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`lines_from_bytes`] | Byte stream to `\n`-delimited lines |
//! | [`SseLineParser`] | `data: {json}` frames with `[DONE]` sentinel |
//! | [`JsonLinesParser`] | One JSON object per line with `content`/`done` |
//! | [`decode_lines`] | Applies a parser to a line stream, yielding deltas |
//! | [`MalformedTracker`] | Malformed-line budget for the head of a stream |
//! | [`UsageCell`] | Token usage reported inside a stream |

pub mod decode;
pub mod parser;

pub use decode::{
    decode_lines, lines_from_bytes, single_delta, DecodeContext, MalformedTracker, UsageCell,
};
pub use parser::{JsonLinesParser, LineParser, MalformedLine, ParsedLine, SseLineParser};

use crate::BoxStream;

/// Lazy, finite, single-pass sequence of text deltas.
pub type TextStream = BoxStream<'static, String>;
