//! Model and capability registries.

pub mod capabilities;
pub mod models;

pub use capabilities::{Capability, CapabilityRegistry};
pub use models::{ModelDescriptor, ModelFilter, ModelRegistry, ModelStatus, ValidationReport};
