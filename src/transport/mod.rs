//! HTTP plumbing shared by the HTTP-backed providers.

pub mod http;

pub use http::{HttpTransport, REQUEST_ID_HEADER};
