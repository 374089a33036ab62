//! Scripted in-process provider.
//!
//! Each call consumes the next [`Script`] from a queue; once the queue is
//! empty the fallback script (if any) repeats. Calls, arguments and stream
//! teardown are recorded so tests can assert on what the router did.

use crate::error_kind::{ClassifiedError, ErrorKind};
use crate::params::Params;
use crate::pipeline::TextStream;
use crate::providers::{downgraded, CallContext, Completion, Provider};
use crate::registry::ModelDescriptor;
use crate::types::{BackendKind, Message, Usage};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// One scripted outcome.
#[derive(Debug, Clone)]
pub enum Script {
    /// Reply with this text (one delta when streamed).
    Reply(String),
    /// Reply with text and usage.
    ReplyWithUsage(String, Usage),
    /// Fail before producing anything.
    Fail(ClassifiedError),
    /// Stream these deltas, then end.
    Stream(Vec<String>),
    /// Stream these deltas, then fail.
    StreamThenFail(Vec<String>, ClassifiedError),
    /// Stream these deltas, then stall until cancelled or dropped.
    StreamThenHang(Vec<String>),
    /// Wait, then run the inner script.
    Delay(Duration, Box<Script>),
}

impl Script {
    pub fn reply(text: impl Into<String>) -> Self {
        Self::Reply(text.into())
    }

    pub fn fail(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self::Fail(ClassifiedError::new(kind, msg))
    }

    pub fn stream<I, S>(deltas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Stream(deltas.into_iter().map(Into::into).collect())
    }
}

/// Arguments of one recorded call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model_id: String,
    pub messages: Vec<Message>,
    pub params: Params,
    pub trace_id: String,
    pub streaming: bool,
}

#[derive(Debug, Default)]
struct Teardown {
    dropped_at: Option<Instant>,
}

struct DropFlag(Arc<Mutex<Teardown>>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        if let Ok(mut t) = self.0.lock() {
            t.dropped_at = Some(Instant::now());
        }
    }
}

#[derive(Debug)]
pub struct ScriptedProvider {
    name: String,
    backend: BackendKind,
    streaming: bool,
    queue: Mutex<VecDeque<Script>>,
    fallback: Option<Script>,
    calls: AtomicU32,
    recorded: Mutex<Vec<RecordedCall>>,
    teardown: Arc<Mutex<Teardown>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            name: name.into(),
            backend,
            streaming: true,
            queue: Mutex::new(VecDeque::new()),
            fallback: None,
            calls: AtomicU32::new(0),
            recorded: Mutex::new(Vec::new()),
            teardown: Arc::new(Mutex::new(Teardown::default())),
        }
    }

    /// Queue a script for the next unscripted call.
    pub fn then(self, script: Script) -> Self {
        if let Ok(mut q) = self.queue.lock() {
            q.push_back(script);
        }
        self
    }

    /// Script used whenever the queue is empty.
    pub fn always(mut self, script: Script) -> Self {
        self.fallback = Some(script);
        self
    }

    /// Behave like a backend that cannot stream.
    pub fn without_streaming(mut self) -> Self {
        self.streaming = false;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.recorded.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// When the last stream handed out was dropped.
    pub fn stream_dropped_at(&self) -> Option<Instant> {
        self.teardown.lock().ok().and_then(|t| t.dropped_at)
    }

    fn next_script(&self) -> Script {
        let queued = self.queue.lock().ok().and_then(|mut q| q.pop_front());
        queued.or_else(|| self.fallback.clone()).unwrap_or_else(|| {
            Script::Fail(ClassifiedError::new(
                ErrorKind::Unknown,
                format!("provider '{}' has no script left", self.name),
            ))
        })
    }

    fn record(
        &self,
        descriptor: &ModelDescriptor,
        messages: &[Message],
        params: &Params,
        ctx: &CallContext,
        streaming: bool,
    ) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut r) = self.recorded.lock() {
            r.push(RecordedCall {
                model_id: descriptor.id.clone(),
                messages: messages.to_vec(),
                params: params.clone(),
                trace_id: ctx.trace_id.clone(),
                streaming,
            });
        }
    }

    fn err(&self, e: ClassifiedError) -> Error {
        let e = if e.provider_name.is_none() {
            e.with_provider(self.name.clone())
        } else {
            e
        };
        Error::Classified(e)
    }

    async fn settle(&self, mut script: Script, ctx: &CallContext) -> Result<Script> {
        while let Script::Delay(d, inner) = script {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(self.err(ClassifiedError::cancelled())),
                _ = tokio::time::sleep(d) => {}
            }
            script = *inner;
        }
        Ok(script)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend_kind(&self) -> BackendKind {
        self.backend
    }

    async fn execute(
        &self,
        descriptor: &ModelDescriptor,
        messages: &[Message],
        params: &Params,
        ctx: &CallContext,
    ) -> Result<Completion> {
        self.record(descriptor, messages, params, ctx, false);
        match self.settle(self.next_script(), ctx).await? {
            Script::Reply(text) => Ok(Completion::new(text)),
            Script::ReplyWithUsage(text, usage) => Ok(Completion::new(text).with_usage(usage)),
            Script::Stream(deltas) => Ok(Completion::new(deltas.concat())),
            Script::Fail(e) | Script::StreamThenFail(_, e) => Err(self.err(e)),
            Script::StreamThenHang(_) => {
                ctx.cancel.cancelled().await;
                Err(self.err(ClassifiedError::cancelled()))
            }
            Script::Delay(..) => unreachable!("settled above"),
        }
    }

    async fn stream_execute(
        &self,
        descriptor: &ModelDescriptor,
        messages: &[Message],
        params: &Params,
        ctx: &CallContext,
    ) -> Result<TextStream> {
        if !self.streaming {
            let completion = self.execute(descriptor, messages, params, ctx).await?;
            return Ok(downgraded(&self.name, ctx, completion));
        }
        self.record(descriptor, messages, params, ctx, true);
        if let Ok(mut t) = self.teardown.lock() {
            t.dropped_at = None;
        }
        let flag = DropFlag(self.teardown.clone());

        let (deltas, tail): (Vec<String>, Option<Result<()>>) =
            match self.settle(self.next_script(), ctx).await? {
                Script::Reply(text) => (vec![text], None),
                Script::ReplyWithUsage(text, usage) => {
                    ctx.usage.record(usage);
                    (vec![text], None)
                }
                Script::Stream(deltas) => (deltas, None),
                Script::Fail(e) => return Err(self.err(e)),
                Script::StreamThenFail(deltas, e) => (deltas, Some(Err(self.err(e)))),
                Script::StreamThenHang(deltas) => (deltas, Some(Ok(()))),
                Script::Delay(..) => unreachable!("settled above"),
            };

        let cancel = ctx.cancel.clone();
        let name = self.name.clone();
        let head = stream::iter(deltas.into_iter().map(Ok));
        let tail = stream::unfold(tail, move |tail| {
            let cancel = cancel.clone();
            let name = name.clone();
            async move {
                match tail? {
                    Err(e) => Some((Err(e), None)),
                    Ok(()) => {
                        cancel.cancelled().await;
                        let e = ClassifiedError::cancelled().with_provider(name);
                        Some((Err(Error::Classified(e)), None))
                    }
                }
            }
        });
        let s = futures::StreamExt::chain(head, tail);
        let s = futures::StreamExt::map(s, move |item| {
            let _held = &flag;
            item
        });
        Ok(Box::pin(s))
    }

    fn validate_config(&self) -> Result<()> {
        Ok(())
    }
}
