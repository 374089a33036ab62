use crate::error_kind::{ClassifiedError, ErrorKind};
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "params.temperature", "steps[2].depends_on")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "config_loader", "parameter_schema")
    pub source: Option<String>,
    /// Actionable hint for the operator
    pub hint: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Unified error type for the router.
///
/// Backend and routing failures travel as [`ClassifiedError`]; the remaining
/// variants cover local concerns (configuration, storage, workflows, I/O).
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Classified(#[from] ClassifiedError),

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Workflow error: {message}{}", format_context(.context))]
    Workflow {
        message: String,
        context: ErrorContext,
    },

    /// Unrecoverable store failure (corruption, unreadable file, failed migration).
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if let Some(ref hint) = ctx.hint {
        parts.push(format!("hint: {}", hint));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Shorthand for a classified error with the kind's default semantics.
    pub fn classified(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Error::Classified(ClassifiedError::new(kind, msg))
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::classified(ErrorKind::InvalidRequest, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::classified(ErrorKind::NotFound, msg)
    }

    pub fn data_integrity(msg: impl Into<String>) -> Self {
        Self::classified(ErrorKind::DataIntegrity, msg)
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    /// Create a new workflow error with structured context
    pub fn workflow_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Workflow {
            message: msg.into(),
            context,
        }
    }

    /// Project any error onto the routing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Classified(e) => e.kind,
            Error::Configuration { .. } | Error::Validation { .. } | Error::Workflow { .. } => {
                ErrorKind::InvalidRequest
            }
            Error::Serialization(_) | Error::Yaml(_) => ErrorKind::Decode,
            Error::Storage(_) | Error::Io(_) => ErrorKind::Unknown,
        }
    }

    /// The classified payload, if this error came from the routing layers.
    pub fn as_classified(&self) -> Option<&ClassifiedError> {
        match self {
            Error::Classified(e) => Some(e),
            _ => None,
        }
    }

    /// Convert into a classified error, wrapping local failures with their projected kind.
    pub fn into_classified(self) -> ClassifiedError {
        match self {
            Error::Classified(e) => e,
            other => {
                let kind = other.kind();
                ClassifiedError::new(kind, other.to_string()).with_retryable(false)
            }
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Validation { context, .. }
            | Error::Workflow { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        match &value {
            sqlx::Error::RowNotFound => Error::not_found("row not found"),
            sqlx::Error::Io(_) => Error::Storage(value.to_string()),
            sqlx::Error::Database(db) => {
                let msg = db.message();
                if msg.starts_with("data-integrity") {
                    Error::data_integrity(msg)
                } else if let Some(rest) = msg.strip_prefix("invalid-request: ") {
                    Error::invalid_request(rest)
                } else if db.is_unique_violation()
                    || db.is_foreign_key_violation()
                    || db.is_check_violation()
                    || msg.contains("constraint failed")
                {
                    Error::invalid_request(format!("constraint violation: {}", msg))
                } else {
                    Error::Storage(value.to_string())
                }
            }
            _ => Error::Storage(value.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(value: sqlx::migrate::MigrateError) -> Self {
        Error::Storage(format!("migration failed: {}", value))
    }
}
