//! kiln-build — compilation plumbing for the Kiln control plane.
//!
//! Three pieces live here:
//!
//! - the [`Bundler`] contract the core consumes (the compiler itself is an
//!   external collaborator; [`FlatBundler`] is the deterministic reference
//!   implementation used by tests and single-file deployments),
//! - canonical content [`fingerprint`]ing of a source tree plus build
//!   options, and
//! - the [`BundleCache`], a read-through/write-through fingerprint cache
//!   that guarantees at most one concurrent build per fingerprint within
//!   the process.

pub mod bundler;
pub mod cache;
pub mod fingerprint;

pub use bundler::{BuildOptions, BuildOutput, Bundler, FlatBundler};
pub use cache::{BuiltBundle, BundleCache, DEFAULT_EPHEMERAL_TTL};
pub use fingerprint::fingerprint;
