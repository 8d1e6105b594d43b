//! Hostname index — exclusive hostname → worker bindings.
//!
//! Forward entries map a hostname to `(tenant, worker)`; the store keeps a
//! reverse index in step with them. Binding a hostname that already points
//! at another worker is a conflict; routes written earlier in the same
//! call are rolled back best-effort before the error surfaces. After the
//! routes land, the worker record's hostname set is brought in line.
//!
//! Without conditional writes in the storage layer, exclusivity under
//! concurrent adds uses compare-after-write repair: write, re-read, and
//! roll back if the re-read disagrees with our own binding.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use kiln_core::{canonical_hostname, Error, HostnameRoute, Result};
use kiln_store::{HostnameStore, WorkerStore};

pub struct HostnameIndex {
    hostnames: Arc<dyn HostnameStore>,
    workers: Arc<dyn WorkerStore>,
}

impl HostnameIndex {
    pub fn new(hostnames: Arc<dyn HostnameStore>, workers: Arc<dyn WorkerStore>) -> Self {
        Self { hostnames, workers }
    }

    /// Look up the worker a hostname routes to.
    pub async fn resolve(&self, hostname: &str) -> Result<Option<HostnameRoute>> {
        self.hostnames.get(&canonical_hostname(hostname)).await
    }

    /// Bind hostnames to a worker.
    ///
    /// Idempotent for hostnames already pointing at this worker. On a
    /// conflict, routes written by this call are removed before the error
    /// is returned; the worker's hostname set is only updated once every
    /// route landed.
    pub async fn add<I, S>(&self, tenant_id: &str, worker_id: &str, hostnames: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut written: Vec<String> = Vec::new();
        let mut bound: Vec<String> = Vec::new();

        for hostname in hostnames {
            let host = canonical_hostname(hostname.as_ref());
            if host.is_empty() {
                self.rollback(&written).await;
                return Err(Error::Validation("empty hostname".to_string()));
            }

            let route = HostnameRoute {
                hostname: host.clone(),
                tenant_id: tenant_id.to_string(),
                worker_id: worker_id.to_string(),
            };

            if let Some(existing) = self.hostnames.get(&host).await? {
                if existing.tenant_id != tenant_id || existing.worker_id != worker_id {
                    self.rollback(&written).await;
                    return Err(Error::Conflict(format!(
                        "hostname {host} already bound to {}:{}",
                        existing.tenant_id, existing.worker_id
                    )));
                }
                // Already ours; keep for the worker-set union below.
                bound.push(host);
                continue;
            }

            self.hostnames.put(&route).await?;

            // Compare-after-write repair for racing writers.
            match self.hostnames.get(&host).await? {
                Some(observed) if observed == route => {}
                _ => {
                    self.rollback(&written).await;
                    return Err(Error::Conflict(format!(
                        "hostname {host} was bound concurrently"
                    )));
                }
            }

            written.push(host.clone());
            bound.push(host);
        }

        self.sync_worker_hostnames(tenant_id, worker_id, &bound, true)
            .await?;
        debug!(tenant = %tenant_id, worker = %worker_id, count = bound.len(), "hostnames bound");
        Ok(())
    }

    /// Unbind hostnames from a worker. Hostnames bound elsewhere are left
    /// alone.
    pub async fn remove<I, S>(&self, tenant_id: &str, worker_id: &str, hostnames: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut removed: Vec<String> = Vec::new();
        for hostname in hostnames {
            let host = canonical_hostname(hostname.as_ref());
            if let Some(existing) = self.hostnames.get(&host).await? {
                if existing.tenant_id == tenant_id && existing.worker_id == worker_id {
                    self.hostnames.delete(&host).await?;
                }
            }
            removed.push(host);
        }
        self.sync_worker_hostnames(tenant_id, worker_id, &removed, false)
            .await?;
        Ok(())
    }

    pub async fn list_by_worker(&self, tenant_id: &str, worker_id: &str) -> Result<Vec<String>> {
        self.hostnames.list_by_worker(tenant_id, worker_id).await
    }

    /// Drop every route of a worker (worker deletion). Returns the count.
    pub async fn delete_by_worker(&self, tenant_id: &str, worker_id: &str) -> Result<u64> {
        self.hostnames.delete_by_worker(tenant_id, worker_id).await
    }

    /// Best-effort removal of routes written earlier in a failed call.
    async fn rollback(&self, written: &[String]) {
        for host in written {
            if let Err(e) = self.hostnames.delete(host).await {
                warn!(hostname = %host, error = %e, "hostname rollback failed");
            }
        }
    }

    /// Union (or difference) the worker record's hostname set with `hosts`
    /// and rewrite the record only when the set actually changes.
    async fn sync_worker_hostnames(
        &self,
        tenant_id: &str,
        worker_id: &str,
        hosts: &[String],
        add: bool,
    ) -> Result<()> {
        if hosts.is_empty() {
            return Ok(());
        }
        let Some(mut worker) = self.workers.get(tenant_id, worker_id).await? else {
            // Routes can outlive a record mid-delete; nothing to sync.
            return Ok(());
        };

        let before = worker.hostnames.len();
        if add {
            worker.hostnames.extend(hosts.iter().cloned());
        } else {
            let drop: BTreeSet<&String> = hosts.iter().collect();
            worker.hostnames.retain(|h| !drop.contains(h));
        }
        if worker.hostnames.len() != before {
            self.workers.put(tenant_id, worker_id, &worker).await?;
        }
        Ok(())
    }
}
