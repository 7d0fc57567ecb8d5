//! # model-exec-host
//!
//! A single-node host that spawns one isolated worker subprocess per model
//! execution job, streams state/log/progress back to an HTTP client, and
//! supervises clean termination.
//!
//! ## Core Concepts
//!
//! - **[`manifest`]** — a model's declared entrypoint and ports.
//! - **[`binding`]** / **[`port`]** — the per-job values bound to those
//!   ports, and the typed, mutation-tracking wrappers user code interacts
//!   with ([`port::Port`]).
//! - **[`exec_ctx::ExecutionContext`]** — the per-job object passed to user
//!   code: ports, upstream-service clients, progress/log reporting.
//! - **[`worker`]** — the harness that runs inside the spawned subprocess:
//!   entrypoint resolution, invocation, and IPC reporting.
//! - **[`supervisor::Supervisor`]** — the host-side process owner: spawn,
//!   poll, detect abnormal termination, and terminate.
//! - **[`http`]** — the `axum` facade exposing the supervisor over HTTP.
//! - **[`ipc`]** — the length-prefixed tagged-message protocol connecting
//!   worker and host.
//!
//! ## Quick Start (embedding a model)
//!
//! ```no_run
//! use model_exec_host::worker::EntrypointRegistry;
//!
//! struct EchoModel;
//! impl model_exec_host::worker::ModelEntrypoint for EchoModel {
//!     fn run(&self, ctx: &model_exec_host::exec_ctx::ExecutionContext) -> model_exec_host::error::Result<()> {
//!         ctx.update(Some("done".to_string()), Some(1.0));
//!         Ok(())
//!     }
//! }
//!
//! fn registry() -> EntrypointRegistry {
//!     EntrypointRegistry::new().register("echo", || Box::new(EchoModel))
//! }
//! ```

pub mod backoff;
pub mod binding;
pub mod client_cache;
pub mod error;
pub mod exec_ctx;
pub mod http;
pub mod ipc;
pub mod log_entry;
pub mod manifest;
pub mod port;
pub mod retry;
pub mod service_config;
pub mod stdio_tee;
pub mod supervisor;
pub mod tracing_bridge;
pub mod worker;

use worker::EntrypointRegistry;

/// The compiled-in model catalog (spec §4.4 "an optional pre-registered
/// table"). Rust has no runtime reflection over module symbols, so unlike
/// the original source's module-introspection fallback, this registry is
/// the *only* resolution path (SPEC_FULL §4.4, recorded in DESIGN.md).
///
/// Concrete model entrypoints are an external collaborator (spec §1
/// Non-goals) — this is the extension point where a deployment registers
/// its own [`worker::ModelEntrypoint`] implementations before building the
/// binary. Shipped empty.
pub fn build_entrypoint_registry() -> EntrypointRegistry {
    EntrypointRegistry::new()
}
