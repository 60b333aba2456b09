//! # Interceptor Core

//! Request-interception engine that sits between client contexts and the
//! network. An interceptor is loaded by a host runtime, moves through an
//! install/activate lifecycle, and once active decides how every request of
//! the clients it controls is satisfied.
//!
//! ## Features
//!
//! - Linear `Uninstalled -> Installed -> Active` lifecycle with opt-in
//!   immediate activation and client claim
//! - Typed handler registration for install, activate and fetch events
//! - Dispatch policies: forward, serve from a local store, or synthesize
//! - Exactly-once fetch resolution enforced by the dispatcher
//! - HTTP proxy front-end for addressable deployments
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 Client contexts (HTTP)                   │
//! ├─────────────────────────────────────────────────────────┤
//! │                 Proxy front-end (hyper)                  │
//! ├─────────────────────────────────────────────────────────┤
//! │                      Host runtime                        │
//! │  ┌───────────┐  ┌─────────────┐  ┌──────────────────┐   │
//! │  │ Lifecycle │  │ Interceptor │  │ Dispatch policy  │   │
//! │  │  Manager  │──│  instance   │──│ forward/serve/.. │   │
//! │  └───────────┘  └─────────────┘  └──────────────────┘   │
//! ├─────────────────────────────────────────────────────────┤
//! │                  Network (reqwest)                       │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod dispatch;
pub mod host;
pub mod interceptor;
pub mod lifecycle;
pub mod models;
pub mod network;
pub mod proxy;

pub use config::{create_default_config, InterceptorConfig};
pub use host::{FetchError, HostRuntime, RegisterOutcome};
pub use interceptor::{EventKind, Interceptor, InterceptorBuilder};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
