//! Data models for the interceptor
//!
//! These models are shared between the host runtime, the lifecycle manager
//! and the dispatch policies.

pub mod request;
pub mod response;

pub use request::*;
pub use response::*;
