//! Byte framing and delta decoding.

use crate::error_kind::{ClassifiedError, ErrorKind};
use crate::pipeline::{LineParser, TextStream};
use crate::types::Usage;
use crate::{BoxStream, Error, Result};
use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use std::sync::{Arc, Mutex};

/// Usage reported in-band by a stream, readable once the stream ends.
///
/// Clones share the same slot. Later reports override earlier fields that
/// they set.
#[derive(Debug, Clone, Default)]
pub struct UsageCell(Arc<Mutex<Option<Usage>>>);

impl UsageCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, usage: Usage) {
        if let Ok(mut slot) = self.0.lock() {
            let merged = match slot.take() {
                Some(prev) => Usage {
                    prompt_tokens: usage.prompt_tokens.or(prev.prompt_tokens),
                    completion_tokens: usage.completion_tokens.or(prev.completion_tokens),
                },
                None => usage,
            };
            *slot = Some(merged);
        }
    }

    pub fn get(&self) -> Option<Usage> {
        self.0.lock().ok().and_then(|slot| *slot)
    }
}

/// Identity attached to decode diagnostics and errors.
#[derive(Debug, Clone, Default)]
pub struct DecodeContext {
    pub provider: String,
    pub trace_id: String,
    /// Receives usage frames as they are decoded.
    pub usage: UsageCell,
}

impl DecodeContext {
    pub fn new(provider: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            trace_id: trace_id.into(),
            usage: UsageCell::new(),
        }
    }

    pub fn with_usage(mut self, usage: UsageCell) -> Self {
        self.usage = usage;
        self
    }

    fn error(&self, kind: ErrorKind, msg: impl Into<String>) -> Error {
        Error::Classified(
            ClassifiedError::new(kind, msg)
                .with_provider(self.provider.clone())
                .with_retryable(false),
        )
    }
}

/// Malformed-line budget over the head of a stream.
///
/// The stream is aborted once more than `max_ratio` of the first `window`
/// lines failed to parse. Beyond the window, malformed lines are only
/// counted. A stream that ends before filling the window is judged on the
/// lines it had.
#[derive(Debug, Clone)]
pub struct MalformedTracker {
    window: usize,
    max_ratio: f64,
    lines: usize,
    window_malformed: usize,
    total_malformed: usize,
}

impl MalformedTracker {
    pub const WINDOW: usize = 50;
    pub const MAX_RATIO: f64 = 0.10;

    pub fn new() -> Self {
        Self::with_limits(Self::WINDOW, Self::MAX_RATIO)
    }

    pub fn with_limits(window: usize, max_ratio: f64) -> Self {
        Self {
            window: window.max(1),
            max_ratio,
            lines: 0,
            window_malformed: 0,
            total_malformed: 0,
        }
    }

    /// Record one line; returns true once the budget is blown.
    pub fn record(&mut self, malformed: bool) -> bool {
        self.lines += 1;
        if malformed {
            self.total_malformed += 1;
            if self.lines <= self.window {
                self.window_malformed += 1;
            }
        }
        self.window_malformed as f64 > self.max_ratio * self.window as f64
    }

    /// Verdict for a stream that ended, possibly before filling the window.
    pub fn exceeded_at_end(&self) -> bool {
        let observed = self.lines.min(self.window);
        observed > 0 && self.window_malformed as f64 / observed as f64 > self.max_ratio
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    pub fn malformed(&self) -> usize {
        self.total_malformed
    }
}

impl Default for MalformedTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a byte stream on `\n`, tolerating chunk boundaries inside UTF-8 sequences.
pub fn lines_from_bytes(input: BoxStream<'static, Bytes>) -> BoxStream<'static, String> {
    let stream = stream::unfold(
        (input, Vec::<u8>::new(), false),
        |(mut input, mut buf, mut eof)| async move {
            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let mut line: Vec<u8> = buf.drain(..=pos).collect();
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    let text = String::from_utf8_lossy(&line).into_owned();
                    return Some((Ok(text), (input, buf, eof)));
                }
                if eof {
                    if buf.is_empty() {
                        return None;
                    }
                    let text = String::from_utf8_lossy(&buf).into_owned();
                    buf.clear();
                    return Some((Ok(text), (input, buf, eof)));
                }
                match input.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        // surface the transport error, then stop
                        buf.clear();
                        return Some((Err(e), (input, buf, true)));
                    }
                    None => eof = true,
                }
            }
        },
    );
    Box::pin(stream)
}

struct DecodeState<S, P> {
    lines: S,
    parser: P,
    tracker: MalformedTracker,
    ctx: DecodeContext,
    pending: Option<Error>,
    finished: bool,
}

/// Apply `parser` to each line, yielding non-empty text deltas.
///
/// Terminates on the parser's done marker, on end of input, on an in-band
/// backend error (`server`), or when the malformed-line budget is exceeded
/// (`decode`).
pub fn decode_lines<S, P>(lines: S, parser: P, ctx: DecodeContext) -> TextStream
where
    S: Stream<Item = Result<String>> + Send + Unpin + 'static,
    P: LineParser + 'static,
{
    let state = DecodeState {
        lines,
        parser,
        tracker: MalformedTracker::new(),
        ctx,
        pending: None,
        finished: false,
    };

    let stream = stream::unfold(state, |mut st| async move {
        loop {
            if let Some(err) = st.pending.take() {
                st.finished = true;
                return Some((Err(err), st));
            }
            if st.finished {
                return None;
            }

            let line = match st.lines.next().await {
                None => {
                    st.finished = true;
                    if st.tracker.exceeded_at_end() {
                        st.pending = Some(budget_error(&st.ctx, &st.tracker));
                    }
                    continue;
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(e), st));
                }
                Some(Ok(line)) => line,
            };

            if line.trim().is_empty() && st.parser.skips_blank_lines() {
                continue;
            }

            match st.parser.parse_line(&line) {
                Err(bad) => {
                    let exceeded = st.tracker.record(true);
                    tracing::warn!(
                        trace_id = %st.ctx.trace_id,
                        event = "malformed_line",
                        provider = %st.ctx.provider,
                        line_no = st.tracker.lines(),
                        malformed = st.tracker.malformed(),
                        reason = %bad,
                        "skipping unparseable stream line"
                    );
                    if exceeded {
                        st.finished = true;
                        let err = budget_error(&st.ctx, &st.tracker);
                        return Some((Err(err), st));
                    }
                }
                Ok(parsed) => {
                    st.tracker.record(false);
                    if let Some(usage) = parsed.usage {
                        st.ctx.usage.record(usage);
                    }
                    if let Some(msg) = parsed.error {
                        st.finished = true;
                        let err = st.ctx.error(ErrorKind::Server, msg);
                        return Some((Err(err), st));
                    }
                    if parsed.done {
                        st.finished = true;
                        if st.tracker.exceeded_at_end() {
                            st.pending = Some(budget_error(&st.ctx, &st.tracker));
                        }
                    }
                    if let Some(text) = parsed.content {
                        return Some((Ok(text), st));
                    }
                }
            }
        }
    });
    Box::pin(stream)
}

fn budget_error(ctx: &DecodeContext, tracker: &MalformedTracker) -> Error {
    ctx.error(
        ErrorKind::Decode,
        format!(
            "too many malformed stream lines ({} of {})",
            tracker.malformed(),
            tracker.lines()
        ),
    )
}

/// Whole response as one delta, used when a backend cannot stream.
pub fn single_delta(text: String) -> TextStream {
    if text.is_empty() {
        Box::pin(stream::empty())
    } else {
        Box::pin(stream::once(async move { Ok(text) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{JsonLinesParser, SseLineParser};

    fn line_stream(lines: Vec<String>) -> BoxStream<'static, String> {
        Box::pin(stream::iter(lines.into_iter().map(Ok)))
    }

    async fn collect(s: TextStream) -> (Vec<String>, Option<Error>) {
        let mut out = Vec::new();
        let mut s = s;
        while let Some(item) = s.next().await {
            match item {
                Ok(t) => out.push(t),
                Err(e) => return (out, Some(e)),
            }
        }
        (out, None)
    }

    #[tokio::test]
    async fn test_bytes_split_across_chunks() {
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"{\"content\":\"h\xc3")),
            Ok(Bytes::from_static(b"\xa9\"}\r\n{\"con")),
            Ok(Bytes::from_static(b"tent\":\"!\"}")),
        ];
        let lines: Vec<String> = lines_from_bytes(Box::pin(stream::iter(chunks)))
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec![r#"{"content":"hé"}"#, r#"{"content":"!"}"#]);
    }

    #[tokio::test]
    async fn test_sse_stops_at_done() {
        let lines = vec![
            r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#.to_string(),
            String::new(),
            r#"data: {"choices":[{"delta":{"content":" world"}}]}"#.to_string(),
            "data: [DONE]".to_string(),
            r#"data: {"choices":[{"delta":{"content":"ignored"}}]}"#.to_string(),
        ];
        let s = decode_lines(
            line_stream(lines),
            SseLineParser::default(),
            DecodeContext::new("p", "t"),
        );
        let (out, err) = collect(s).await;
        assert_eq!(out, vec!["Hello", " world"]);
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn test_nine_percent_malformed_succeeds() {
        let lines: Vec<String> = (0..100)
            .map(|i| {
                if i % 11 == 5 {
                    "{broken".to_string()
                } else {
                    format!(r#"{{"content":"t{}","done":false}}"#, i)
                }
            })
            .collect();
        let bad = lines.iter().filter(|l| l.starts_with("{broken")).count();
        assert_eq!(bad, 9);
        let (out, err) = collect(decode_lines(
            line_stream(lines),
            JsonLinesParser::flat(),
            DecodeContext::new("p", "t"),
        ))
        .await;
        assert!(err.is_none());
        assert_eq!(out.len(), 91);
    }

    #[tokio::test]
    async fn test_twenty_percent_malformed_aborts_with_decode() {
        let lines: Vec<String> = (0..100)
            .map(|i| {
                if i % 5 == 0 {
                    "not json".to_string()
                } else {
                    format!(r#"{{"content":"t{}"}}"#, i)
                }
            })
            .collect();
        let (out, err) = collect(decode_lines(
            line_stream(lines),
            JsonLinesParser::flat(),
            DecodeContext::new("p", "t"),
        ))
        .await;
        let err = err.expect("stream must abort");
        assert_eq!(err.kind(), ErrorKind::Decode);
        // aborted inside the first 50 lines
        assert!(out.len() < 50);
    }

    #[tokio::test]
    async fn test_short_stream_judged_at_end() {
        let lines = vec![
            "oops".to_string(),
            r#"{"content":"a"}"#.to_string(),
            r#"{"content":"b","done":true}"#.to_string(),
        ];
        let (out, err) = collect(decode_lines(
            line_stream(lines),
            JsonLinesParser::flat(),
            DecodeContext::new("p", "t"),
        ))
        .await;
        assert_eq!(out, vec!["a", "b"]);
        assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::Decode));
    }

    #[tokio::test]
    async fn test_in_band_error_is_server() {
        let lines = vec![
            r#"{"content":"a"}"#.to_string(),
            r#"{"error":"model crashed"}"#.to_string(),
        ];
        let (out, err) = collect(decode_lines(
            line_stream(lines),
            JsonLinesParser::flat(),
            DecodeContext::new("p", "t"),
        ))
        .await;
        assert_eq!(out, vec!["a"]);
        assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::Server));
    }

    #[tokio::test]
    async fn test_usage_frames_reach_the_cell() {
        let lines = vec![
            r#"data: {"choices":[{"delta":{"content":"hi"}}]}"#.to_string(),
            r#"data: {"choices":[],"usage":{"prompt_tokens":7,"completion_tokens":3}}"#.to_string(),
            "data: [DONE]".to_string(),
        ];
        let usage = UsageCell::new();
        let (out, err) = collect(decode_lines(
            line_stream(lines),
            SseLineParser::default(),
            DecodeContext::new("p", "t").with_usage(usage.clone()),
        ))
        .await;
        assert!(err.is_none());
        assert_eq!(out, vec!["hi"]);
        let got = usage.get().unwrap();
        assert_eq!(got.prompt_tokens, Some(7));
        assert_eq!(got.total(), Some(10));
    }

    #[test]
    fn test_usage_cell_merges_partial_reports() {
        let cell = UsageCell::new();
        assert!(cell.get().is_none());
        cell.record(Usage {
            prompt_tokens: Some(4),
            completion_tokens: None,
        });
        cell.clone().record(Usage {
            prompt_tokens: None,
            completion_tokens: Some(6),
        });
        assert_eq!(cell.get().unwrap().total(), Some(10));
    }

    #[test]
    fn test_tracker_budget() {
        let mut t = MalformedTracker::new();
        for i in 0..50 {
            let exceeded = t.record(i < 5);
            assert!(!exceeded, "five of fifty is within budget");
        }
        assert!(!t.record(true), "outside window only counted");
        let mut t = MalformedTracker::new();
        let blown = (0..6).map(|_| t.record(true)).last().unwrap();
        assert!(blown);
    }
}
