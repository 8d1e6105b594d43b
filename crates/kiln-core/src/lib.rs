//! kiln-core — shared domain types for the Kiln control plane.
//!
//! Kiln manages tenants, their dynamic workers, compiled bundles, hostname
//! routes, and worker templates. This crate holds the types those records
//! share, the platform-wide error taxonomy, and the pure configuration
//! resolver that merges platform defaults, tenant config, and worker
//! config into the effective config handed to the runtime loader.
//!
//! All records are JSON-serializable; persistence backends store them in
//! `&[u8]` value columns keyed by composite string keys.

pub mod error;
pub mod resolve;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use resolve::{resolve, FALLBACK_COMPATIBILITY_DATE};
pub use types::*;
