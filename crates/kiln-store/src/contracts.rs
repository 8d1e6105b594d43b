//! Storage contracts consumed by the control plane.
//!
//! Each contract covers one key family of the persisted-state layout. All
//! operations are async and may fail with `Error::Storage`; absence is
//! `Ok(None)`. Ordering guarantees are not assumed beyond single-key
//! linearizability.

use std::time::Duration;

use async_trait::async_trait;
use kiln_core::{Bundle, ConfigBundle, HostnameRoute, Result, TemplateRecord, TenantRecord, WorkerRecord};

/// Default page size when a list call does not set a limit.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Options for paginated list operations.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Only keys starting with this prefix.
    pub prefix: Option<String>,
    /// Maximum items per page.
    pub limit: Option<usize>,
    /// Opaque continuation token from a previous page.
    pub cursor: Option<String>,
}

/// One page of a list result.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Present when more items may follow; pass back as `ListOptions::cursor`.
    pub cursor: Option<String>,
}

/// Persistence of tenant records, keyed by tenant id.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<TenantRecord>>;
    async fn put(&self, id: &str, record: &TenantRecord) -> Result<()>;
    /// Returns true if the record existed.
    async fn delete(&self, id: &str) -> Result<bool>;
    async fn list(&self, opts: ListOptions) -> Result<Page<TenantRecord>>;
}

/// Persistence of worker records, keyed by `{tenant_id}:{worker_id}`.
#[async_trait]
pub trait WorkerStore: Send + Sync {
    async fn get(&self, tenant_id: &str, worker_id: &str) -> Result<Option<WorkerRecord>>;
    async fn put(&self, tenant_id: &str, worker_id: &str, record: &WorkerRecord) -> Result<()>;
    async fn delete(&self, tenant_id: &str, worker_id: &str) -> Result<bool>;
    async fn list(&self, tenant_id: &str, opts: ListOptions) -> Result<Page<WorkerRecord>>;
    /// Delete every worker of a tenant. Returns the number deleted.
    async fn delete_all(&self, tenant_id: &str) -> Result<u64>;
}

/// Persistence of compiled bundles.
///
/// Two key families live here: versioned bundles at
/// `{tenant_id}:{worker_id}:v{n}` (never expire) and fingerprint-keyed
/// cache entries (may carry a TTL, filtered out on read once expired).
#[async_trait]
pub trait BundleStore: Send + Sync {
    async fn get(&self, tenant_id: &str, worker_id: &str, version: u64) -> Result<Option<Bundle>>;
    async fn put(
        &self,
        tenant_id: &str,
        worker_id: &str,
        version: u64,
        bundle: &Bundle,
    ) -> Result<()>;
    /// Delete every version for a worker. Returns the number deleted.
    async fn delete_all(&self, tenant_id: &str, worker_id: &str) -> Result<u64>;

    async fn get_fingerprint(&self, fingerprint: &str) -> Result<Option<Bundle>>;
    async fn put_fingerprint(
        &self,
        fingerprint: &str,
        bundle: &Bundle,
        ttl: Option<Duration>,
    ) -> Result<()>;
}

/// Persistence of hostname routes.
///
/// The reverse index (`{tenant_id}:{worker_id}:{hostname}`) is maintained
/// atomically with the forward write; both implementations here perform
/// the pair under one lock or one write transaction.
#[async_trait]
pub trait HostnameStore: Send + Sync {
    async fn get(&self, hostname: &str) -> Result<Option<HostnameRoute>>;
    async fn put(&self, route: &HostnameRoute) -> Result<()>;
    async fn delete(&self, hostname: &str) -> Result<bool>;
    async fn list_by_worker(&self, tenant_id: &str, worker_id: &str) -> Result<Vec<String>>;
    /// Delete every route of a worker. Returns the number deleted.
    async fn delete_by_worker(&self, tenant_id: &str, worker_id: &str) -> Result<u64>;
}

/// Persistence of worker templates, keyed by template id.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<TemplateRecord>>;
    async fn put(&self, id: &str, record: &TemplateRecord) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<bool>;
    async fn list(&self, opts: ListOptions) -> Result<Page<TemplateRecord>>;
}

/// Persistence of the platform-defaults singleton.
#[async_trait]
pub trait DefaultsStore: Send + Sync {
    async fn get(&self) -> Result<Option<ConfigBundle>>;
    async fn put(&self, defaults: &ConfigBundle) -> Result<()>;
}

/// Paginate sorted `(key, value)` pairs: skip past the cursor, apply the
/// prefix filter, and cut one page. Shared by the store implementations.
pub(crate) fn paginate<T>(
    entries: impl Iterator<Item = (String, T)>,
    opts: &ListOptions,
) -> Page<T> {
    let limit = opts.limit.unwrap_or(DEFAULT_LIST_LIMIT).max(1);
    let mut items = Vec::new();
    let mut last_key: Option<String> = None;
    let mut more = false;

    for (key, value) in entries {
        if let Some(cursor) = &opts.cursor {
            if key.as_str() <= cursor.as_str() {
                continue;
            }
        }
        if let Some(prefix) = &opts.prefix {
            if !key.starts_with(prefix.as_str()) {
                continue;
            }
        }
        if items.len() == limit {
            more = true;
            break;
        }
        last_key = Some(key);
        items.push(value);
    }

    Page {
        items,
        cursor: if more { last_key } else { None },
    }
}
