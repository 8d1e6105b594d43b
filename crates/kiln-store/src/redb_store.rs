//! RedbStores — redb-backed persistence for Kiln.
//!
//! Implements every storage contract over a single embedded database. All
//! values are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).
//!
//! Hostname forward and reverse entries are written inside one write
//! transaction, which gives the atomicity the hostname contract requires.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::debug;

use kiln_core::{
    bundle_key, worker_key, Bundle, ConfigBundle, Error, HostnameRoute, Result, TemplateRecord,
    TenantRecord, WorkerRecord,
};

use crate::contracts::{
    paginate, BundleStore, DefaultsStore, HostnameStore, ListOptions, Page, TemplateStore,
    TenantStore, WorkerStore,
};
use crate::tables::*;

/// Convert any `Display` error into `Error::Storage` with a context label.
macro_rules! map_err {
    ($ctx:literal) => {
        |e| Error::Storage(format!(concat!($ctx, ": {}"), e))
    };
}

/// Fingerprint-keyed cache entry as persisted, carrying its expiry.
#[derive(Debug, Serialize, Deserialize)]
struct CachedBundle {
    bundle: Bundle,
    expires_at: Option<DateTime<Utc>>,
}

/// Thread-safe store backed by redb.
#[derive(Clone)]
pub struct RedbStores {
    db: Arc<Database>,
}

impl RedbStores {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(map_err!("open database"))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "kiln store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!("open database"))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory kiln store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> Result<()> {
        let txn = self.db.begin_write().map_err(map_err!("transaction"))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(TENANTS).map_err(map_err!("table"))?;
        txn.open_table(WORKERS).map_err(map_err!("table"))?;
        txn.open_table(BUNDLES).map_err(map_err!("table"))?;
        txn.open_table(BUNDLE_FINGERPRINTS).map_err(map_err!("table"))?;
        txn.open_table(HOSTNAMES).map_err(map_err!("table"))?;
        txn.open_table(HOSTNAME_INDEX).map_err(map_err!("table"))?;
        txn.open_table(TEMPLATES).map_err(map_err!("table"))?;
        txn.open_table(DEFAULTS).map_err(map_err!("table"))?;
        txn.commit().map_err(map_err!("transaction"))?;
        Ok(())
    }

    /// Insert one JSON-serialized record.
    fn put_json<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!("serialize"))?;
        let txn = self.db.begin_write().map_err(map_err!("transaction"))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!("table"))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!("write"))?;
        }
        txn.commit().map_err(map_err!("transaction"))?;
        Ok(())
    }

    /// Read one JSON-serialized record.
    fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!("transaction"))?;
        let table = txn.open_table(table).map_err(map_err!("table"))?;
        match table.get(key).map_err(map_err!("read"))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!("deserialize"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Remove one record. Returns true if it existed.
    fn remove(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> Result<bool> {
        let txn = self.db.begin_write().map_err(map_err!("transaction"))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!("table"))?;
            existed = table.remove(key).map_err(map_err!("write"))?.is_some();
        }
        txn.commit().map_err(map_err!("transaction"))?;
        Ok(existed)
    }

    /// Collect `(key, value)` pairs, optionally restricted to a key prefix.
    fn scan<T: for<'de> Deserialize<'de>>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        prefix: Option<&str>,
    ) -> Result<Vec<(String, T)>> {
        let txn = self.db.begin_read().map_err(map_err!("transaction"))?;
        let table = txn.open_table(table).map_err(map_err!("table"))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!("read"))? {
            let (key, value) = entry.map_err(map_err!("read"))?;
            if let Some(prefix) = prefix {
                if !key.value().starts_with(prefix) {
                    continue;
                }
            }
            let record = serde_json::from_slice(value.value()).map_err(map_err!("deserialize"))?;
            results.push((key.value().to_string(), record));
        }
        Ok(results)
    }

    /// Delete every key with the given prefix. Returns the number deleted.
    fn delete_prefix(&self, table: TableDefinition<&str, &[u8]>, prefix: &str) -> Result<u64> {
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!("transaction"))?;
            let table = txn.open_table(table).map_err(map_err!("table"))?;
            table
                .iter()
                .map_err(map_err!("read"))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(prefix).then_some(k)
                })
                .collect()
        };
        // Delete in a write transaction.
        let txn = self.db.begin_write().map_err(map_err!("transaction"))?;
        let count = keys.len() as u64;
        {
            let mut table = txn.open_table(table).map_err(map_err!("table"))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!("write"))?;
            }
        }
        txn.commit().map_err(map_err!("transaction"))?;
        Ok(count)
    }

    fn reverse_key(tenant_id: &str, worker_id: &str, hostname: &str) -> String {
        format!("{tenant_id}:{worker_id}:{hostname}")
    }
}

#[async_trait]
impl TenantStore for RedbStores {
    async fn get(&self, id: &str) -> Result<Option<TenantRecord>> {
        self.get_json(TENANTS, id)
    }

    async fn put(&self, id: &str, record: &TenantRecord) -> Result<()> {
        self.put_json(TENANTS, id, record)?;
        debug!(%id, "tenant stored");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.remove(TENANTS, id)
    }

    async fn list(&self, opts: ListOptions) -> Result<Page<TenantRecord>> {
        let entries = self.scan::<TenantRecord>(TENANTS, None)?;
        Ok(paginate(entries.into_iter(), &opts))
    }
}

#[async_trait]
impl WorkerStore for RedbStores {
    async fn get(&self, tenant_id: &str, worker_id: &str) -> Result<Option<WorkerRecord>> {
        self.get_json(WORKERS, &worker_key(tenant_id, worker_id))
    }

    async fn put(&self, tenant_id: &str, worker_id: &str, record: &WorkerRecord) -> Result<()> {
        let key = worker_key(tenant_id, worker_id);
        self.put_json(WORKERS, &key, record)?;
        debug!(%key, version = record.version, "worker stored");
        Ok(())
    }

    async fn delete(&self, tenant_id: &str, worker_id: &str) -> Result<bool> {
        self.remove(WORKERS, &worker_key(tenant_id, worker_id))
    }

    async fn list(&self, tenant_id: &str, opts: ListOptions) -> Result<Page<WorkerRecord>> {
        // A caller prefix filters worker ids within the tenant scope.
        let scope = format!("{tenant_id}:");
        let prefix = match &opts.prefix {
            Some(p) => format!("{scope}{p}"),
            None => scope,
        };
        let entries = self.scan::<WorkerRecord>(WORKERS, Some(&prefix))?;
        let opts = ListOptions {
            prefix: None,
            ..opts
        };
        Ok(paginate(entries.into_iter(), &opts))
    }

    async fn delete_all(&self, tenant_id: &str) -> Result<u64> {
        self.delete_prefix(WORKERS, &format!("{tenant_id}:"))
    }
}

#[async_trait]
impl BundleStore for RedbStores {
    async fn get(&self, tenant_id: &str, worker_id: &str, version: u64) -> Result<Option<Bundle>> {
        self.get_json(BUNDLES, &bundle_key(tenant_id, worker_id, version))
    }

    async fn put(
        &self,
        tenant_id: &str,
        worker_id: &str,
        version: u64,
        bundle: &Bundle,
    ) -> Result<()> {
        let key = bundle_key(tenant_id, worker_id, version);
        self.put_json(BUNDLES, &key, bundle)?;
        debug!(%key, "bundle stored");
        Ok(())
    }

    async fn delete_all(&self, tenant_id: &str, worker_id: &str) -> Result<u64> {
        self.delete_prefix(BUNDLES, &format!("{tenant_id}:{worker_id}:v"))
    }

    async fn get_fingerprint(&self, fingerprint: &str) -> Result<Option<Bundle>> {
        let cached: Option<CachedBundle> = self.get_json(BUNDLE_FINGERPRINTS, fingerprint)?;
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
            Some(ttl) => {
                Some(Utc::now() + chrono::Duration::from_std(ttl).map_err(map_err!("ttl"))?)
            }
            None => None,
        };
        let entry = CachedBundle {
            bundle: bundle.clone(),
            expires_at,
        };
        self.put_json(BUNDLE_FINGERPRINTS, fingerprint, &entry)?;
        debug!(%fingerprint, "fingerprint bundle stored");
        Ok(())
    }
}

#[async_trait]
impl HostnameStore for RedbStores {
    async fn get(&self, hostname: &str) -> Result<Option<HostnameRoute>> {
        self.get_json(HOSTNAMES, hostname)
    }

    async fn put(&self, route: &HostnameRoute) -> Result<()> {
        let bytes = serde_json::to_vec(route).map_err(map_err!("serialize"))?;
        let txn = self.db.begin_write().map_err(map_err!("transaction"))?;
        {
            let mut forward = txn.open_table(HOSTNAMES).map_err(map_err!("table"))?;
            let mut reverse = txn.open_table(HOSTNAME_INDEX).map_err(map_err!("table"))?;

            // Re-pointing a hostname drops the old reverse entry first.
            let previous = forward
                .get(route.hostname.as_str())
                .map_err(map_err!("read"))?
                .map(|guard| serde_json::from_slice::<HostnameRoute>(guard.value()))
                .transpose()
                .map_err(map_err!("deserialize"))?;
            if let Some(old) = previous {
                reverse
                    .remove(Self::reverse_key(&old.tenant_id, &old.worker_id, &old.hostname).as_str())
                    .map_err(map_err!("write"))?;
            }

            forward
                .insert(route.hostname.as_str(), bytes.as_slice())
                .map_err(map_err!("write"))?;
            reverse
                .insert(
                    Self::reverse_key(&route.tenant_id, &route.worker_id, &route.hostname).as_str(),
                    route.hostname.as_bytes(),
                )
                .map_err(map_err!("write"))?;
        }
        txn.commit().map_err(map_err!("transaction"))?;
        debug!(hostname = %route.hostname, "hostname route stored");
        Ok(())
    }

    async fn delete(&self, hostname: &str) -> Result<bool> {
        let txn = self.db.begin_write().map_err(map_err!("transaction"))?;
        let existed;
        {
            let mut forward = txn.open_table(HOSTNAMES).map_err(map_err!("table"))?;
            let mut reverse = txn.open_table(HOSTNAME_INDEX).map_err(map_err!("table"))?;

            let route = forward
                .remove(hostname)
                .map_err(map_err!("write"))?
                .map(|guard| serde_json::from_slice::<HostnameRoute>(guard.value()))
                .transpose()
                .map_err(map_err!("deserialize"))?;
            existed = route.is_some();
            if let Some(route) = route {
                reverse
                    .remove(
                        Self::reverse_key(&route.tenant_id, &route.worker_id, &route.hostname)
                            .as_str(),
                    )
                    .map_err(map_err!("write"))?;
            }
        }
        txn.commit().map_err(map_err!("transaction"))?;
        Ok(existed)
    }

    async fn list_by_worker(&self, tenant_id: &str, worker_id: &str) -> Result<Vec<String>> {
        let scope = format!("{tenant_id}:{worker_id}:");
        let txn = self.db.begin_read().map_err(map_err!("transaction"))?;
        let table = txn.open_table(HOSTNAME_INDEX).map_err(map_err!("table"))?;
        let mut hosts = Vec::new();
        for entry in table.iter().map_err(map_err!("read"))? {
            let (key, value) = entry.map_err(map_err!("read"))?;
            if key.value().starts_with(&scope) {
                let host =
                    String::from_utf8(value.value().to_vec()).map_err(map_err!("deserialize"))?;
                hosts.push(host);
            }
        }
        Ok(hosts)
    }

    async fn delete_by_worker(&self, tenant_id: &str, worker_id: &str) -> Result<u64> {
        let hosts = self.list_by_worker(tenant_id, worker_id).await?;
        let txn = self.db.begin_write().map_err(map_err!("transaction"))?;
        {
            let mut forward = txn.open_table(HOSTNAMES).map_err(map_err!("table"))?;
            let mut reverse = txn.open_table(HOSTNAME_INDEX).map_err(map_err!("table"))?;
            for host in &hosts {
                forward.remove(host.as_str()).map_err(map_err!("write"))?;
                reverse
                    .remove(Self::reverse_key(tenant_id, worker_id, host).as_str())
                    .map_err(map_err!("write"))?;
            }
        }
        txn.commit().map_err(map_err!("transaction"))?;
        Ok(hosts.len() as u64)
    }
}

#[async_trait]
impl TemplateStore for RedbStores {
    async fn get(&self, id: &str) -> Result<Option<TemplateRecord>> {
        self.get_json(TEMPLATES, id)
    }

    async fn put(&self, id: &str, record: &TemplateRecord) -> Result<()> {
        self.put_json(TEMPLATES, id, record)?;
        debug!(%id, "template stored");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.remove(TEMPLATES, id)
    }

    async fn list(&self, opts: ListOptions) -> Result<Page<TemplateRecord>> {
        let entries = self.scan::<TemplateRecord>(TEMPLATES, None)?;
        Ok(paginate(entries.into_iter(), &opts))
    }
}

#[async_trait]
impl DefaultsStore for RedbStores {
    async fn get(&self) -> Result<Option<ConfigBundle>> {
        self.get_json(DEFAULTS, DEFAULTS_KEY)
    }

    async fn put(&self, defaults: &ConfigBundle) -> Result<()> {
        self.put_json(DEFAULTS, DEFAULTS_KEY, defaults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn test_tenant(id: &str) -> TenantRecord {
        TenantRecord {
            id: id.to_string(),
            config: ConfigBundle::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn test_worker(tenant_id: &str, id: &str, version: u64) -> WorkerRecord {
        WorkerRecord {
            tenant_id: tenant_id.to_string(),
            id: id.to_string(),
            config: ConfigBundle::default(),
            files: BTreeMap::from([("src/index.ts".to_string(), "export {}".to_string())]),
            hostnames: Default::default(),
            version,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn test_bundle(version: u64) -> Bundle {
        Bundle {
            main_module: "src/index.ts".to_string(),
            modules: BTreeMap::from([("src/index.ts".to_string(), "export {}".to_string())]),
            version,
            built_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn tenant_round_trip() {
        let store = RedbStores::open_in_memory().unwrap();
        let record = test_tenant("acme");

        TenantStore::put(&store, "acme", &record).await.unwrap();
        assert_eq!(TenantStore::get(&store, "acme").await.unwrap(), Some(record));
        assert!(TenantStore::delete(&store, "acme").await.unwrap());
        assert!(TenantStore::get(&store, "acme").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn worker_prefix_scan_and_delete_all() {
        let store = RedbStores::open_in_memory().unwrap();
        WorkerStore::put(&store, "acme", "api", &test_worker("acme", "api", 1))
            .await
            .unwrap();
        WorkerStore::put(&store, "acme", "web", &test_worker("acme", "web", 1))
            .await
            .unwrap();
        WorkerStore::put(&store, "acme-2", "api", &test_worker("acme-2", "api", 1))
            .await
            .unwrap();

        let page = WorkerStore::list(&store, "acme", ListOptions::default())
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);

        assert_eq!(WorkerStore::delete_all(&store, "acme").await.unwrap(), 2);
        // `acme-2` keys do not match the `acme:` scope.
        assert!(WorkerStore::get(&store, "acme-2", "api").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn bundle_versions_accumulate_until_delete_all() {
        let store = RedbStores::open_in_memory().unwrap();
        for version in 1..=3 {
            BundleStore::put(&store, "acme", "api", version, &test_bundle(version))
                .await
                .unwrap();
        }

        assert!(BundleStore::get(&store, "acme", "api", 2).await.unwrap().is_some());
        assert_eq!(BundleStore::delete_all(&store, "acme", "api").await.unwrap(), 3);
        assert!(BundleStore::get(&store, "acme", "api", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fingerprint_ttl_expires_on_read() {
        let store = RedbStores::open_in_memory().unwrap();
        BundleStore::put_fingerprint(&store, "cafe0123cafe0123", &test_bundle(0), None)
            .await
            .unwrap();
        BundleStore::put_fingerprint(
            &store,
            "feed4567feed4567",
            &test_bundle(0),
            Some(Duration::from_secs(0)),
        )
        .await
        .unwrap();

        assert!(BundleStore::get_fingerprint(&store, "cafe0123cafe0123")
            .await
            .unwrap()
            .is_some());
        assert!(BundleStore::get_fingerprint(&store, "feed4567feed4567")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn hostname_reverse_index_tracks_forward_writes() {
        let store = RedbStores::open_in_memory().unwrap();
        let route = HostnameRoute {
            hostname: "app.acme.com".to_string(),
            tenant_id: "acme".to_string(),
            worker_id: "api".to_string(),
        };
        HostnameStore::put(&store, &route).await.unwrap();

        assert_eq!(
            HostnameStore::list_by_worker(&store, "acme", "api").await.unwrap(),
            vec!["app.acme.com"]
        );

        // Re-point to another worker; old reverse entry disappears.
        let moved = HostnameRoute {
            worker_id: "web".to_string(),
            ..route.clone()
        };
        HostnameStore::put(&store, &moved).await.unwrap();
        assert!(HostnameStore::list_by_worker(&store, "acme", "api")
            .await
            .unwrap()
            .is_empty());

        assert_eq!(
            HostnameStore::delete_by_worker(&store, "acme", "web").await.unwrap(),
            1
        );
        assert!(HostnameStore::get(&store, "app.acme.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("kiln.redb");

        {
            let store = RedbStores::open(&db_path).unwrap();
            TenantStore::put(&store, "acme", &test_tenant("acme")).await.unwrap();
        }

        // Reopen the same database file.
        let store = RedbStores::open(&db_path).unwrap();
        let tenant = TenantStore::get(&store, "acme").await.unwrap();
        assert!(tenant.is_some());
        assert_eq!(tenant.unwrap().id, "acme");
    }

    #[tokio::test]
    async fn empty_store_operations() {
        let store = RedbStores::open_in_memory().unwrap();

        assert!(TenantStore::list(&store, ListOptions::default())
            .await
            .unwrap()
            .items
            .is_empty());
        assert!(!TenantStore::delete(&store, "nope").await.unwrap());
        assert!(!WorkerStore::delete(&store, "nope", "nothing").await.unwrap());
        assert_eq!(WorkerStore::delete_all(&store, "nope").await.unwrap(), 0);
        assert_eq!(
            HostnameStore::delete_by_worker(&store, "nope", "nothing").await.unwrap(),
            0
        );
        assert!(DefaultsStore::get(&store).await.unwrap().is_none());
    }
}
