//! # authstore
//!
//! Hybrid fast/durable storage for per-session authentication state: a
//! write-through fast tier backed by optimistic concurrency control, a
//! lenient-upsert durable tier reached through a circuit breaker, and an
//! optional write-behind path (transactional outbox + background
//! reconciler) for absorbing durable-tier latency without blocking callers.
//!
//! ## Modules
//!
//! - [`config`]: tunables for TTLs, resilience, security, observability.
//! - [`model`]: [`model::AuthSnapshot`], [`model::AuthPatch`], and the
//!   versioned wrapper types shared by both tiers.
//! - [`codec`]: the encode/encrypt/base64 boundary the durable tier uses
//!   for field-level storage.
//! - [`tiers`]: the [`tiers::FastTier`] and [`tiers::DurableTier`]
//!   contracts plus in-process reference implementations.
//! - [`lock_table`]: bounded per-session mutual exclusion for writes.
//! - [`breaker`]: the circuit breaker guarding durable-tier calls.
//! - [`outbox`] / [`queue`] / [`reconciler`]: the write-behind pipeline.
//! - [`metrics`]: the Prometheus-style metrics registry.
//! - [`orchestrator`]: [`orchestrator::HybridStore`], the public facade.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod breaker;
pub mod codec;
pub mod config;
pub mod error;
pub mod lock_table;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod outbox;
pub mod queue;
pub mod reconciler;
pub mod tiers;

pub use config::HybridConfig;
pub use error::{StorageKind, StoreError, StoreResult};
pub use model::{AuthPatch, AuthSnapshot, BatchDeleteResult, SessionId, Versioned, VersionedResult, VersionMeta};
pub use orchestrator::{HybridStore, OutboxStats};

/// Crate version, as declared in `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name, as declared in `Cargo.toml`.
pub const NAME: &str = env!("CARGO_PKG_NAME");
