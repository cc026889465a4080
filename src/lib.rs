//! # DeltaDatabase
//!
//! An encrypted-at-rest JSON document store split into a stateless control
//! plane (Main Worker) and a horizontally scalable data plane (Processing
//! Workers). Clients address entities by `(database, key)`; every write is
//! validated against a JSON Schema, sealed with AES-256-GCM before
//! touching shared storage, and every read is served from a per-worker LRU
//! cache with version-based coherence.
//!
//! ## Architecture
//!
//! - `crypto`: AES-GCM sealing, RSA-OAEP key wrapping, the in-memory
//!   master key cell
//! - `storage`: filesystem and S3-compatible backends plus per-entity
//!   lock backends
//! - `schema`: draft-07 JSON Schema validation with memoized templates
//! - `cache`: per-worker LRU of decrypted entities
//! - `auth`: admin-key / API-key / session-token credential tiers
//! - `registry`: worker registry and the cache-affinity router
//! - `server`: Main Worker REST surface and subscribe/heartbeat service
//! - `worker`: Processing Worker handshake and GET/PUT data path

#![warn(clippy::all)]

pub mod auth;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod error;
pub mod registry;
pub mod schema;
pub mod server;
pub mod storage;
pub mod worker;

/// Generated gRPC bindings for the internal control and data planes.
pub mod proto {
    #![allow(clippy::all)]
    tonic::include_proto!("deltadb.v1");
}

pub use error::{DeltaError, DeltaResult};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
