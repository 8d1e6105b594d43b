//! In-memory reference implementation of the storage contracts.
//!
//! Backed by `RwLock`-guarded `BTreeMap`s so list operations come back in
//! key order. This is the implementation the test suites run against; it
//! keeps the same key discipline as the redb store, including the hostname
//! reverse index and fingerprint expiry.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::{
    bundle_key, worker_key, Bundle, ConfigBundle, HostnameRoute, Result, TemplateRecord,
    TenantRecord, WorkerRecord,
};
use tokio::sync::RwLock;

use crate::contracts::{
    paginate, BundleStore, DefaultsStore, HostnameStore, ListOptions, Page, TemplateStore,
    TenantStore, WorkerStore,
};

/// Fingerprint-keyed cache entry with optional expiry.
#[derive(Debug, Clone)]
struct CachedBundle {
    bundle: Bundle,
    expires_at: Option<DateTime<Utc>>,
}

/// Forward and reverse hostname maps, mutated under one lock.
#[derive(Debug, Default)]
struct HostnameMaps {
    /// hostname → route
    forward: BTreeMap<String, HostnameRoute>,
    /// `{tenant_id}:{worker_id}:{hostname}` → hostname
    reverse: BTreeMap<String, String>,
}

/// In-memory store implementing all six contracts.
#[derive(Debug, Default)]
pub struct MemoryStores {
    tenants: RwLock<BTreeMap<String, TenantRecord>>,
    workers: RwLock<BTreeMap<String, WorkerRecord>>,
    bundles: RwLock<BTreeMap<String, Bundle>>,
    fingerprints: RwLock<BTreeMap<String, CachedBundle>>,
    hostnames: RwLock<HostnameMaps>,
    templates: RwLock<BTreeMap<String, TemplateRecord>>,
    defaults: RwLock<Option<ConfigBundle>>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    fn reverse_key(tenant_id: &str, worker_id: &str, hostname: &str) -> String {
        format!("{tenant_id}:{worker_id}:{hostname}")
    }
}

#[async_trait]
impl TenantStore for MemoryStores {
    async fn get(&self, id: &str) -> Result<Option<TenantRecord>> {
        Ok(self.tenants.read().await.get(id).cloned())
    }

    async fn put(&self, id: &str, record: &TenantRecord) -> Result<()> {
        self.tenants
            .write()
            .await
            .insert(id.to_string(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.tenants.write().await.remove(id).is_some())
    }

    async fn list(&self, opts: ListOptions) -> Result<Page<TenantRecord>> {
        let tenants = self.tenants.read().await;
        Ok(paginate(
            tenants.iter().map(|(k, v)| (k.clone(), v.clone())),
            &opts,
        ))
    }
}

#[async_trait]
impl WorkerStore for MemoryStores {
    async fn get(&self, tenant_id: &str, worker_id: &str) -> Result<Option<WorkerRecord>> {
        let key = worker_key(tenant_id, worker_id);
        Ok(self.workers.read().await.get(&key).cloned())
    }

    async fn put(&self, tenant_id: &str, worker_id: &str, record: &WorkerRecord) -> Result<()> {
        let key = worker_key(tenant_id, worker_id);
        self.workers.write().await.insert(key, record.clone());
        Ok(())
    }

    async fn delete(&self, tenant_id: &str, worker_id: &str) -> Result<bool> {
        let key = worker_key(tenant_id, worker_id);
        Ok(self.workers.write().await.remove(&key).is_some())
    }

    async fn list(&self, tenant_id: &str, opts: ListOptions) -> Result<Page<WorkerRecord>> {
        // A caller prefix filters worker ids within the tenant scope.
        let scope = format!("{tenant_id}:");
        let prefix = match &opts.prefix {
            Some(p) => format!("{scope}{p}"),
            None => scope,
        };
        let opts = ListOptions {
            prefix: Some(prefix),
            ..opts
        };
        let workers = self.workers.read().await;
        Ok(paginate(
            workers.iter().map(|(k, v)| (k.clone(), v.clone())),
            &opts,
        ))
    }

    async fn delete_all(&self, tenant_id: &str) -> Result<u64> {
        let scope = format!("{tenant_id}:");
        let mut workers = self.workers.write().await;
        let before = workers.len();
        workers.retain(|k, _| !k.starts_with(&scope));
        Ok((before - workers.len()) as u64)
    }
}

#[async_trait]
impl BundleStore for MemoryStores {
    async fn get(&self, tenant_id: &str, worker_id: &str, version: u64) -> Result<Option<Bundle>> {
        let key = bundle_key(tenant_id, worker_id, version);
        Ok(self.bundles.read().await.get(&key).cloned())
    }

    async fn put(
        &self,
        tenant_id: &str,
        worker_id: &str,
        version: u64,
        bundle: &Bundle,
    ) -> Result<()> {
        let key = bundle_key(tenant_id, worker_id, version);
        self.bundles.write().await.insert(key, bundle.clone());
        Ok(())
    }

    async fn delete_all(&self, tenant_id: &str, worker_id: &str) -> Result<u64> {
        let scope = format!("{tenant_id}:{worker_id}:v");
        let mut bundles = self.bundles.write().await;
        let before = bundles.len();
        bundles.retain(|k, _| !k.starts_with(&scope));
        Ok((before - bundles.len()) as u64)
    }

    async fn get_fingerprint(&self, fingerprint: &str) -> Result<Option<Bundle>> {
        let cached = self.fingerprints.read().await.get(fingerprint).cloned();
        Ok(cached.and_then(|entry| match entry.expires_at {
            Some(deadline) if deadline <= Utc::now() => None,
            _ => Some(entry.bundle),
        }))
    }

    async fn put_fingerprint(
        &self,
        fingerprint: &str,
        bundle: &Bundle,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let expires_at = match ttl {
            Some(ttl) => Some(
                Utc::now()
                    + chrono::Duration::from_std(ttl)
                        .map_err(|e| kiln_core::Error::storage(e))?,
            ),
            None => None,
        };
        self.fingerprints.write().await.insert(
            fingerprint.to_string(),
            CachedBundle {
                bundle: bundle.clone(),
                expires_at,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl HostnameStore for MemoryStores {
    async fn get(&self, hostname: &str) -> Result<Option<HostnameRoute>> {
        Ok(self.hostnames.read().await.forward.get(hostname).cloned())
    }

    async fn put(&self, route: &HostnameRoute) -> Result<()> {
        let mut maps = self.hostnames.write().await;
        // Re-pointing a hostname drops the old reverse entry first.
        if let Some(old) = maps.forward.get(&route.hostname).cloned() {
            maps.reverse.remove(&Self::reverse_key(
                &old.tenant_id,
                &old.worker_id,
                &old.hostname,
            ));
        }
        maps.reverse.insert(
            Self::reverse_key(&route.tenant_id, &route.worker_id, &route.hostname),
            route.hostname.clone(),
        );
        maps.forward.insert(route.hostname.clone(), route.clone());
        Ok(())
    }

    async fn delete(&self, hostname: &str) -> Result<bool> {
        let mut maps = self.hostnames.write().await;
        match maps.forward.remove(hostname) {
            Some(route) => {
                maps.reverse.remove(&Self::reverse_key(
                    &route.tenant_id,
                    &route.worker_id,
                    &route.hostname,
                ));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_by_worker(&self, tenant_id: &str, worker_id: &str) -> Result<Vec<String>> {
        let scope = format!("{tenant_id}:{worker_id}:");
        let maps = self.hostnames.read().await;
        Ok(maps
            .reverse
            .iter()
            .filter(|(k, _)| k.starts_with(&scope))
            .map(|(_, host)| host.clone())
            .collect())
    }

    async fn delete_by_worker(&self, tenant_id: &str, worker_id: &str) -> Result<u64> {
        let scope = format!("{tenant_id}:{worker_id}:");
        let mut maps = self.hostnames.write().await;
        let hosts: Vec<String> = maps
            .reverse
            .iter()
            .filter(|(k, _)| k.starts_with(&scope))
            .map(|(_, host)| host.clone())
            .collect();
        for host in &hosts {
            maps.forward.remove(host);
        }
        maps.reverse.retain(|k, _| !k.starts_with(&scope));
        Ok(hosts.len() as u64)
    }
}

#[async_trait]
impl TemplateStore for MemoryStores {
    async fn get(&self, id: &str) -> Result<Option<TemplateRecord>> {
        Ok(self.templates.read().await.get(id).cloned())
    }

    async fn put(&self, id: &str, record: &TemplateRecord) -> Result<()> {
        self.templates
            .write()
            .await
            .insert(id.to_string(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.templates.write().await.remove(id).is_some())
    }

    async fn list(&self, opts: ListOptions) -> Result<Page<TemplateRecord>> {
        let templates = self.templates.read().await;
        Ok(paginate(
            templates.iter().map(|(k, v)| (k.clone(), v.clone())),
            &opts,
        ))
    }
}

#[async_trait]
impl DefaultsStore for MemoryStores {
    async fn get(&self) -> Result<Option<ConfigBundle>> {
        Ok(self.defaults.read().await.clone())
    }

    async fn put(&self, defaults: &ConfigBundle) -> Result<()> {
        *self.defaults.write().await = Some(defaults.clone());
        Ok(())
    }
}
