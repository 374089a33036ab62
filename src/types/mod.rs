//! Core value types shared across the router.

pub mod backend;
pub mod message;

pub use backend::BackendKind;
pub use message::{Message, MessageRole, Usage};
