//! # llm-router
//!
//! Local LLM request router: picks a model and a backend for each request,
//! calls it with retries and fallback, streams tokens back to the caller and
//! journals the exchange into a durable SQLite session store.
//!
//! ## Overview
//!
//! A [`router::Request`] names a model (or `"auto"`), carries messages and
//! canonical generation parameters, and optionally a session to journal into.
//! The [`Router`] resolves the model through the [`registry`], normalizes the
//! parameters through the backend's [`params`] schema and runs the backend's
//! provider chain. Every provider call sits inside a retry envelope with a
//! shared deadline and cooperative cancellation. Failures leave every layer as
//! a [`ClassifiedError`] with one of a closed set of [`ErrorKind`]s.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use llm_router::config::ConfigLoader;
//! use llm_router::{Message, Request, Router};
//!
//! #[tokio::main]
//! async fn main() -> llm_router::Result<()> {
//!     llm_router::telemetry::init_logging(Default::default())?;
//!     let config = ConfigLoader::from_env().load()?;
//!     let router = Router::from_config(config).await?;
//!
//!     let request = Request::new("auto", vec![Message::user("write a rust function")]);
//!     let mut stream = router.stream(request).await?;
//!     while let Some(delta) = stream.next().await {
//!         print!("{}", delta?);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`registry`] | Model descriptors, availability checks, backend capabilities |
//! | [`params`] | Per-backend parameter schemas and normalization |
//! | [`providers`] | Local inference, remote chat and local server backends |
//! | [`pipeline`] | SSE / JSON-lines stream framing |
//! | [`classify`] | Raw failure to [`ErrorKind`] mapping |
//! | [`resilience`] | Retry envelope, provider health, fallback chains |
//! | [`router`] | Request routing, use-case detection, journaling |
//! | [`session`] | SQLite session store |
//! | [`workflow`] | Declarative multi-step workflows |
//! | [`config`] | Configuration documents and environment overrides |
//! | [`telemetry`] | NDJSON logging with secret redaction |

pub mod classify;
pub mod config;
pub mod error_kind;
pub mod params;
pub mod pipeline;
pub mod providers;
pub mod registry;
pub mod resilience;
pub mod router;
pub mod session;
pub mod telemetry;
pub mod transport;
pub mod types;
pub mod utils;
pub mod workflow;

pub use error_kind::{ClassifiedError, ErrorKind};
pub use providers::Provider;
pub use registry::{ModelDescriptor, ModelRegistry};
pub use router::{Request, RouteOutput, RouteResponse, RouteStream, Router, RouterBuilder};
pub use session::SessionStore;
pub use types::{BackendKind, Message, MessageRole};
pub use workflow::{Workflow, WorkflowEngine};

use futures::Stream;
use std::pin::Pin;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// A specialized Result for pipeline operations
pub type PipeResult<T> = std::result::Result<T, Error>;

/// A unified pinned, boxed stream that emits `PipeResult<T>`
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = PipeResult<T>> + Send + 'a>>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
