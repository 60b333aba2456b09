//! HTTP proxy front-end
//!
//! This module contains the listener that exposes the host runtime to
//! clients over HTTP.

pub mod server;

pub use server::*;
