//! Subprocess provider for a native inference binary.
//!
//! The binary is started directly from a structured argv, never through a
//! shell. The prompt travels over stdin by default, or as a single argv
//! element when the args template contains `{prompt}`. Placeholders in the
//! template:
//!
//! | Placeholder    | Value                                              |
//! |----------------|----------------------------------------------------|
//! | `{model}`      | resolved model location (Windows form if needed)   |
//! | `{threads}`    | `HardwareProfile::cpu_threads`                     |
//! | `{gpu_layers}` | `999` with GPU offload, `0` otherwise              |
//! | `{prompt}`     | rendered prompt (argv mode only)                   |
//!
//! Normalized parameters follow the template as `--<native> <value>` pairs.
//! Stdout is read as JSON-lines; a non-zero exit is classified from stderr.

use crate::classify::classify_exit;
use crate::config::profile::wsl_to_windows;
use crate::config::{HardwareProfile, LocalInferenceOptions, Platform, PromptInput, ProviderConfig};
use crate::error_kind::{ClassifiedError, ErrorKind};
use crate::params::Params;
use crate::pipeline::{decode_lines, DecodeContext, JsonLinesParser, TextStream};
use crate::providers::{
    downgraded, hold, render_prompt, CallContext, Completion, ConcurrencyLimit, Provider,
};
use crate::registry::ModelDescriptor;
use crate::types::{BackendKind, Message};
use crate::{BoxStream, Error, ErrorContext, Result};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const MAX_STDERR_BYTES: usize = 16 * 1024;

pub struct LocalInference {
    config: ProviderConfig,
    options: LocalInferenceOptions,
    profile: HardwareProfile,
    locks: std::sync::Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
    limit: ConcurrencyLimit,
}

impl std::fmt::Debug for LocalInference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalInference")
            .field("name", &self.config.name)
            .field("binary", &self.options.binary)
            .finish()
    }
}

/// A prepared invocation.
#[derive(Debug)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Prompt to write to stdin, when not passed in argv.
    pub stdin: Option<String>,
    /// Host path of the model weights; the per-location lock key.
    pub location: PathBuf,
}

impl LocalInference {
    pub fn new(config: ProviderConfig, profile: HardwareProfile) -> Result<Self> {
        let options = config.local.clone().ok_or_else(|| {
            Error::configuration_with_context(
                "local-inference providers require a `local` section",
                ErrorContext::new()
                    .with_field_path("local")
                    .with_source(format!("provider:{}", config.name)),
            )
        })?;
        let limit = ConcurrencyLimit::new(config.name.clone(), config.max_concurrency);
        Ok(Self {
            config,
            options,
            profile,
            locks: std::sync::Mutex::new(HashMap::new()),
            limit,
        })
    }

    /// Build argv and stdin payload for one call.
    pub fn invocation(
        &self,
        descriptor: &ModelDescriptor,
        messages: &[Message],
        params: &Params,
    ) -> Invocation {
        let location = self.profile.resolve_location(&descriptor.location);
        let host_path = location.to_string_lossy().into_owned();
        let model_arg = if self.options.windows_binary && self.profile.platform == Platform::LinuxWsl {
            wsl_to_windows(&host_path).unwrap_or(host_path)
        } else {
            host_path
        };
        let prompt = render_prompt(messages);
        let gpu_layers = if self.profile.gpu_offload() { "999" } else { "0" };
        let threads = self.profile.cpu_threads.to_string();

        let mut args: Vec<String> = self
            .options
            .args
            .iter()
            .map(|a| {
                let a = a
                    .replace("{model}", &model_arg)
                    .replace("{threads}", &threads)
                    .replace("{gpu_layers}", gpu_layers);
                if self.options.prompt_input == PromptInput::Argv {
                    a.replace("{prompt}", &prompt)
                } else {
                    a
                }
            })
            .collect();

        for (name, value) in params {
            match value {
                Value::Bool(true) => args.push(format!("--{}", name)),
                Value::Bool(false) | Value::Null => {}
                Value::Array(items) => {
                    for item in items {
                        args.push(format!("--{}", name));
                        args.push(scalar(item));
                    }
                }
                other => {
                    args.push(format!("--{}", name));
                    args.push(scalar(other));
                }
            }
        }

        Invocation {
            program: self.options.binary.clone(),
            args,
            stdin: match self.options.prompt_input {
                PromptInput::Stdin => Some(prompt),
                PromptInput::Argv => None,
            },
            location,
        }
    }

    fn location_lock(&self, location: &Path) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(location.to_path_buf())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn error(&self, kind: ErrorKind, msg: impl Into<String>) -> Error {
        Error::Classified(ClassifiedError::new(kind, msg).with_provider(self.config.name.clone()))
    }

    async fn spawn_stream(
        &self,
        descriptor: &ModelDescriptor,
        messages: &[Message],
        params: &Params,
        ctx: &CallContext,
    ) -> Result<TextStream> {
        let permit = self.limit.acquire(ctx).await?;
        let inv = self.invocation(descriptor, messages, params);

        let location_guard = if self.options.serialize_per_location {
            let lock = self.location_lock(&inv.location);
            let guard = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    return Err(Error::Classified(
                        ClassifiedError::cancelled().with_provider(self.config.name.clone()),
                    ));
                }
                g = lock.lock_owned() => g,
            };
            Some(guard)
        } else {
            None
        };

        tracing::debug!(
            trace_id = %ctx.trace_id,
            event = "subprocess_spawn",
            provider = %self.config.name,
            program = %inv.program.display(),
            argc = inv.args.len(),
            "starting inference process"
        );

        let mut child = Command::new(&inv.program)
            .args(&inv.args)
            .stdin(if inv.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                let kind = if e.kind() == std::io::ErrorKind::NotFound {
                    ErrorKind::InvalidRequest
                } else {
                    ErrorKind::Server
                };
                self.error(kind, format!("cannot start {}: {}", inv.program.display(), e))
            })?;

        if let (Some(mut stdin), Some(prompt)) = (child.stdin.take(), inv.stdin) {
            tokio::spawn(async move {
                // the child may exit before reading everything
                let _ = stdin.write_all(prompt.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    match stderr.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if buf.len() < MAX_STDERR_BYTES {
                                buf.extend_from_slice(&chunk[..n]);
                            }
                        }
                    }
                }
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.error(ErrorKind::Server, "inference process has no stdout"))?;

        let lines = child_lines(ChildLines {
            reader: BufReader::new(stdout),
            child,
            stderr: stderr_task,
            cancel: ctx.cancel.clone(),
            provider: self.config.name.clone(),
            finished: false,
        });
        let deltas = decode_lines(
            lines,
            JsonLinesParser::flat(),
            DecodeContext::new(self.config.name.clone(), ctx.trace_id.clone())
                .with_usage(ctx.usage.clone()),
        );
        Ok(hold(deltas, (permit, location_guard)))
    }
}

fn scalar(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct ChildLines {
    reader: BufReader<ChildStdout>,
    child: Child,
    stderr: Option<JoinHandle<String>>,
    cancel: CancellationToken,
    provider: String,
    finished: bool,
}

/// Stdout lines, then a classified error if the process exits non-zero.
fn child_lines(state: ChildLines) -> BoxStream<'static, String> {
    let s = stream::unfold(state, |mut st| async move {
        if st.finished {
            return None;
        }
        let mut line = String::new();
        let read = tokio::select! {
            biased;
            _ = st.cancel.cancelled() => {
                let _ = st.child.start_kill();
                st.finished = true;
                let err = ClassifiedError::cancelled().with_provider(st.provider.clone());
                return Some((Err(Error::Classified(err)), st));
            }
            r = st.reader.read_line(&mut line) => r,
        };
        match read {
            Ok(0) => {
                st.finished = true;
                let status = st.child.wait().await;
                let stderr = match st.stderr.take() {
                    Some(h) => h.await.unwrap_or_default(),
                    None => String::new(),
                };
                match status {
                    Ok(s) if s.success() => None,
                    Ok(s) => {
                        let err = classify_exit(s.code(), &stderr, &st.provider);
                        Some((Err(Error::Classified(err)), st))
                    }
                    Err(e) => {
                        let err = ClassifiedError::new(ErrorKind::Server, e.to_string())
                            .with_provider(st.provider.clone());
                        Some((Err(Error::Classified(err)), st))
                    }
                }
            }
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\n', '\r']).to_string();
                Some((Ok(trimmed), st))
            }
            Err(e) => {
                st.finished = true;
                let _ = st.child.start_kill();
                let err = ClassifiedError::new(ErrorKind::Server, format!("stdout read failed: {}", e))
                    .with_provider(st.provider.clone());
                Some((Err(Error::Classified(err)), st))
            }
        }
    });
    Box::pin(s)
}

#[async_trait]
impl Provider for LocalInference {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::LocalInference
    }

    async fn execute(
        &self,
        descriptor: &ModelDescriptor,
        messages: &[Message],
        params: &Params,
        ctx: &CallContext,
    ) -> Result<Completion> {
        let mut deltas = self.spawn_stream(descriptor, messages, params, ctx).await?;
        let mut text = String::new();
        while let Some(delta) = deltas.next().await {
            text.push_str(&delta?);
        }
        Ok(Completion::new(text))
    }

    async fn stream_execute(
        &self,
        descriptor: &ModelDescriptor,
        messages: &[Message],
        params: &Params,
        ctx: &CallContext,
    ) -> Result<TextStream> {
        if !self.config.streaming {
            let completion = self.execute(descriptor, messages, params, ctx).await?;
            return Ok(downgraded(&self.config.name, ctx, completion));
        }
        self.spawn_stream(descriptor, messages, params, ctx).await
    }

    fn validate_config(&self) -> Result<()> {
        self.config.validate()?;
        let binary = &self.options.binary;
        // bare names are resolved through PATH at spawn time
        if binary.components().count() > 1 && !binary.is_file() {
            return Err(Error::configuration_with_context(
                format!("inference binary {} does not exist", binary.display()),
                ErrorContext::new()
                    .with_field_path("local.binary")
                    .with_source(format!("provider:{}", self.config.name)),
            ));
        }
        Ok(())
    }
}
