//! Stub cache — loader handles keyed by `(tenant, worker)`.
//!
//! Each entry is guarded by the worker version it was loaded for; a fetch
//! that observes a newer record bypasses the entry and replaces it.
//! Entries are non-owning and replaceable: invalidation is key removal,
//! and concurrent cold starts resolve last-writer-wins (all stubs for one
//! version are equivalent).

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use kiln_core::worker_key;

use crate::loader::Stub;

/// A cached loader handle and the worker version it belongs to.
#[derive(Clone)]
pub struct StubEntry {
    pub version: u64,
    pub stub: Arc<dyn Stub>,
}

/// In-process cache of loader stubs.
#[derive(Default)]
pub struct StubCache {
    entries: DashMap<String, StubEntry>,
}

impl StubCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tenant_id: &str, worker_id: &str) -> Option<StubEntry> {
        self.entries
            .get(&worker_key(tenant_id, worker_id))
            .map(|entry| entry.clone())
    }

    pub fn insert(&self, tenant_id: &str, worker_id: &str, version: u64, stub: Arc<dyn Stub>) {
        let key = worker_key(tenant_id, worker_id);
        debug!(%key, version, "stub cached");
        self.entries.insert(key, StubEntry { version, stub });
    }

    /// Drop the entry for one worker.
    pub fn invalidate(&self, tenant_id: &str, worker_id: &str) {
        self.entries.remove(&worker_key(tenant_id, worker_id));
    }

    /// Drop every entry belonging to a tenant.
    pub fn invalidate_tenant(&self, tenant_id: &str) {
        let scope = format!("{tenant_id}:");
        self.entries.retain(|key, _| !key.starts_with(&scope));
    }

    /// Drop everything (defaults changed).
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{GatewayRequest, GatewayResponse, Result};

    struct NullStub;

    impl Stub for NullStub {
        fn get_entrypoint(&self, _name: Option<&str>) -> Result<Box<dyn crate::loader::Fetcher>> {
            Ok(Box::new(NullFetcher))
        }
    }

    struct NullFetcher;

    #[async_trait::async_trait]
    impl crate::loader::Fetcher for NullFetcher {
        async fn dispatch(&self, _req: GatewayRequest) -> Result<GatewayResponse> {
            Ok(GatewayResponse::ok(""))
        }
    }

    fn stub() -> Arc<dyn Stub> {
        Arc::new(NullStub)
    }

    #[test]
    fn get_returns_version_guarded_entry() {
        let cache = StubCache::new();
        cache.insert("acme", "api", 3, stub());

        let entry = cache.get("acme", "api").unwrap();
        assert_eq!(entry.version, 3);
        assert!(cache.get("acme", "web").is_none());
    }

    #[test]
    fn insert_replaces_previous_entry() {
        let cache = StubCache::new();
        cache.insert("acme", "api", 1, stub());
        cache.insert("acme", "api", 2, stub());

        assert_eq!(cache.get("acme", "api").unwrap().version, 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn tenant_invalidation_is_prefix_scoped() {
        let cache = StubCache::new();
        cache.insert("acme", "api", 1, stub());
        cache.insert("acme", "web", 1, stub());
        cache.insert("acme-corp", "api", 1, stub());

        cache.invalidate_tenant("acme");

        assert!(cache.get("acme", "api").is_none());
        assert!(cache.get("acme", "web").is_none());
        // Longer tenant id sharing the prefix is untouched.
        assert!(cache.get("acme-corp", "api").is_some());
    }

    #[test]
    fn clear_empties_the_cache() {
        let cache = StubCache::new();
        cache.insert("acme", "api", 1, stub());
        cache.insert("beta", "api", 1, stub());

        cache.clear();
        assert!(cache.is_empty());
    }
}
