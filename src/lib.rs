//! Keystone Gateway - a multi-tenant HTTP reverse proxy whose routing and
//! per-request behavior is driven by embedded Lua scripts.
//!
//! Keystone follows a **hexagonal architecture**: `core` holds the
//! tenant/backend/routing domain logic and never touches a socket directly;
//! `adapters` wire that logic to HTTP (request validation, the proxy
//! director, the admin surface, the health checker, the outbound HTTP
//! client); `ports` are the traits the adapters implement so `core` stays
//! testable without a live network. `scripting` is the embedded Lua runtime:
//! bytecode compilation and caching, a bounded per-tenant interpreter pool,
//! and the primitive API surface (`register_route`, `req`/`res`,
//! `context_set`/`context_get`, `http_get`/`post`/`put`/`delete`, `log`)
//! exposed to tenant scripts. `router` holds the compiled per-tenant route
//! snapshot scripts register into at load time.
//!
//! # Architecture
//! Prefer the re-exports below over reaching into internal modules; the
//! binary crate (`main.rs`) wires everything together for the `serve` and
//! `validate` CLI commands.
//!
//! # Error Handling
//! Fallible top-level APIs return `eyre::Result<T>`; domain-specific errors
//! (`ScriptError`, `ValidationError`, `HttpClientError`, `RouterBuildError`)
//! are `thiserror` enums propagated with `?` through the layers above them.
//!
//! # Concurrency & Data Structures
//! The tenant table and connection tracker use `scc::HashMap` rather than a
//! `std`/`dashmap` map for predictable behavior under contention; the active
//! configuration and each tenant's router snapshot are held behind
//! `arc_swap::ArcSwap` so reload is a single atomic pointer exchange with no
//! reader-side locking.
//!
//! # License
//! Dual-licensed under either MIT or Apache-2.0 at your option.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod router;
pub mod scripting;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{HttpClientAdapter, HttpHandler},
    core::GatewayService,
    ports::http_client::HttpClient,
    utils::{ConnectionTracker, GracefulShutdown},
};
