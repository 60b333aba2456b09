//! Interceptor API
//!
//! This module defines the public entry points an embedding process calls.

pub mod proxy_api;
