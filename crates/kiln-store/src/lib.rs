//! kiln-store — persistence contracts and reference stores for Kiln.
//!
//! The control plane consumes six narrow async contracts: tenants, workers,
//! bundles (versioned keys plus a fingerprint-keyed cache family), hostname
//! routes (forward plus reverse index), templates, and the platform-defaults
//! singleton. Two implementations ship here:
//!
//! - [`MemoryStores`] — `RwLock`-guarded maps, the reference implementation
//!   used throughout the test suites.
//! - [`RedbStores`] — an embedded redb database with JSON-serialized values
//!   and composite string keys, for persistent single-node deployments.
//!
//! Callers treat absence as `Ok(None)`; transport failures surface as
//! `Error::Storage` and are never retried here.

pub mod contracts;
pub mod memory;
pub mod redb_store;
pub mod tables;

pub use contracts::{
    BundleStore, DefaultsStore, HostnameStore, ListOptions, Page, TemplateStore, TenantStore,
    WorkerStore,
};
pub use memory::MemoryStores;
pub use redb_store::RedbStores;
