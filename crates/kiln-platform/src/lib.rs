//! kiln-platform — the control plane of the Kiln dynamic-worker platform.
//!
//! Wires the storage contracts, the bundle cache, the hostname index, and
//! the stub cache behind one [`Platform`] façade: tenant / worker /
//! template CRUD, request dispatch (`fetch`), ephemeral runs, and
//! hostname routing. The compiler and the runtime stay behind the
//! [`Bundler`](kiln_build::Bundler) and [`Loader`] contracts.
//!
//! # Request path
//!
//! `route(req)` → hostname index → `fetch(tenant, worker)` → stub cache →
//! on miss: load records, resolve config, cold-start from the bundle
//! store → dispatch.

pub mod hostnames;
pub mod loader;
pub mod platform;
pub mod stubs;
pub mod testing;

pub use hostnames::HostnameIndex;
pub use loader::{
    ColdStart, EphemeralColdStart, Fetcher, Loader, Stub, VersionedColdStart, WorkerDescriptor,
};
pub use platform::{
    BuildInfo, FromTemplate, Platform, PlatformStores, RunOptions, RunOutcome, RunTiming,
};
pub use stubs::{StubCache, StubEntry};
