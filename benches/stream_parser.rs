//! Benchmarks for stream framing
//!
//! This benchmark measures:
//! - SSE line parsing speed
//! - JSON-lines parsing speed
//! - Full decode throughput, clean and with malformed lines mixed in

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use futures::{stream, StreamExt};
use llm_router::pipeline::{decode_lines, DecodeContext, JsonLinesParser, LineParser, SseLineParser};

/// Chat-completions style SSE frames
const SSE_FRAMES: &[&str] = &[
    r#"data: {"id":"c1","object":"chat.completion.chunk","choices":[{"index":0,"delta":{"role":"assistant","content":""},"finish_reason":null}]}"#,
    r#"data: {"id":"c1","object":"chat.completion.chunk","choices":[{"index":0,"delta":{"content":"Hello"},"finish_reason":null}]}"#,
    r#"data: {"id":"c1","object":"chat.completion.chunk","choices":[{"index":0,"delta":{"content":" there"},"finish_reason":null}]}"#,
    r#"data: {"id":"c1","object":"chat.completion.chunk","choices":[{"index":0,"delta":{"content":"!"},"finish_reason":null}]}"#,
    r#"data: {"id":"c1","object":"chat.completion.chunk","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
];

/// Local server JSON-lines frames
const JSONL_FRAMES: &[&str] = &[
    r#"{"model":"m","message":{"role":"assistant","content":"Hello"},"done":false}"#,
    r#"{"model":"m","message":{"role":"assistant","content":" there"},"done":false}"#,
    r#"{"model":"m","message":{"role":"assistant","content":"!"},"done":false}"#,
];

fn bench_line_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("line_parsing");
    let sse = SseLineParser::default();
    let jsonl = JsonLinesParser::with_content_path("message.content").unwrap();

    let frame = SSE_FRAMES[1];
    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("sse_content_frame", |b| {
        b.iter(|| black_box(sse.parse_line(black_box(frame))))
    });

    let frame = JSONL_FRAMES[0];
    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("jsonl_content_frame", |b| {
        b.iter(|| black_box(jsonl.parse_line(black_box(frame))))
    });

    group.bench_function("sse_done_sentinel", |b| {
        b.iter(|| black_box(sse.parse_line(black_box("data: [DONE]"))))
    });

    group.finish();
}

fn frames(malformed_every: Option<usize>) -> Vec<String> {
    let mut out: Vec<String> = SSE_FRAMES
        .iter()
        .cycle()
        .take(100)
        .enumerate()
        .map(|(i, f)| match malformed_every {
            Some(n) if i % n == n - 1 => "data: {not json".to_string(),
            _ => f.to_string(),
        })
        .collect();
    out.push("data: [DONE]".to_string());
    out
}

fn bench_decode_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_throughput");
    let rt = tokio::runtime::Runtime::new().unwrap();

    for (name, lines) in [("clean_100", frames(None)), ("malformed_5pct", frames(Some(20)))] {
        group.throughput(Throughput::Elements(lines.len() as u64));
        group.bench_function(name, |b| {
            b.to_async(&rt).iter(|| {
                let lines = lines.clone();
                async move {
                    let input = stream::iter(lines.into_iter().map(Ok::<_, llm_router::Error>)).boxed();
                    let text: Vec<_> = decode_lines(
                        input,
                        SseLineParser::default(),
                        DecodeContext::new("bench", "trace"),
                    )
                    .collect()
                    .await;
                    black_box(text)
                }
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_line_parsing, bench_decode_throughput);
criterion_main!(benches);
