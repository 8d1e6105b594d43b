//! redb table definitions for the Kiln store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Composite keys follow the pattern `{tenant_id}:{worker_id}` and
//! `{tenant_id}:{worker_id}:v{version}`.

use redb::TableDefinition;

/// Tenant records keyed by `{tenant_id}`.
pub const TENANTS: TableDefinition<&str, &[u8]> = TableDefinition::new("tenants");

/// Worker records keyed by `{tenant_id}:{worker_id}`.
pub const WORKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("workers");

/// Versioned bundles keyed by `{tenant_id}:{worker_id}:v{version}`.
pub const BUNDLES: TableDefinition<&str, &[u8]> = TableDefinition::new("bundles");

/// Fingerprint-keyed bundle cache entries keyed by the 16-hex fingerprint.
pub const BUNDLE_FINGERPRINTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("bundle_fingerprints");

/// Hostname routes keyed by `{hostname}`.
pub const HOSTNAMES: TableDefinition<&str, &[u8]> = TableDefinition::new("hostnames");

/// Hostname reverse index keyed by `{tenant_id}:{worker_id}:{hostname}`,
/// value is the bare hostname.
pub const HOSTNAME_INDEX: TableDefinition<&str, &[u8]> = TableDefinition::new("hostname_index");

/// Template records keyed by `{template_id}`.
pub const TEMPLATES: TableDefinition<&str, &[u8]> = TableDefinition::new("templates");

/// Platform-defaults singleton under the key `platform-defaults`.
pub const DEFAULTS: TableDefinition<&str, &[u8]> = TableDefinition::new("platform_defaults");

/// The single key used in [`DEFAULTS`].
pub const DEFAULTS_KEY: &str = "platform-defaults";
