//! The platform façade — public operations of the Kiln control plane.
//!
//! Orchestrates the stores, the bundle cache, the hostname index, the stub
//! cache, and the loader. Write ordering is load-bearing throughout:
//! bundles land before the worker records that reference them, persisted
//! defaults land before stub invalidation, and cascade deletes run
//! leaf-first. A reader therefore only ever observes `ACTIVE(vN)` or
//! `ACTIVE(vN+1)`, never a torn state.
//!
//! Nothing here retries: every failure surfaces to the caller with its
//! classification. Re-invoking an interrupted cascade delete resumes it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use kiln_build::{BuildOptions, BuiltBundle, Bundler, BundleCache};
use kiln_core::{
    resolve, worker_key, Bundle, ConfigBundle, ConfigPatch, Error, FileMap, GatewayRequest,
    GatewayResponse, Result, TemplateMetadata, TemplateRecord, TenantRecord, TenantSpec,
    WorkerPatch, WorkerRecord, WorkerSpec,
};
use kiln_store::{
    BundleStore, DefaultsStore, HostnameStore, ListOptions, MemoryStores, Page, RedbStores,
    TemplateStore, TenantStore, WorkerStore,
};

use crate::hostnames::HostnameIndex;
use crate::loader::{EphemeralColdStart, Loader, Stub, VersionedColdStart};
use crate::stubs::StubCache;

/// The storage contracts the platform operates over.
#[derive(Clone)]
pub struct PlatformStores {
    pub tenants: Arc<dyn TenantStore>,
    pub workers: Arc<dyn WorkerStore>,
    pub bundles: Arc<dyn BundleStore>,
    pub hostnames: Arc<dyn HostnameStore>,
    pub templates: Arc<dyn TemplateStore>,
    pub defaults: Arc<dyn DefaultsStore>,
}

impl PlatformStores {
    /// All contracts backed by one in-memory store.
    pub fn from_memory(stores: Arc<MemoryStores>) -> Self {
        Self {
            tenants: stores.clone(),
            workers: stores.clone(),
            bundles: stores.clone(),
            hostnames: stores.clone(),
            templates: stores.clone(),
            defaults: stores,
        }
    }

    /// All contracts backed by one redb database.
    pub fn from_redb(stores: RedbStores) -> Self {
        let stores = Arc::new(stores);
        Self {
            tenants: stores.clone(),
            workers: stores.clone(),
            bundles: stores.clone(),
            hostnames: stores.clone(),
            templates: stores.clone(),
            defaults: stores,
        }
    }
}

/// Options for an ephemeral run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunOptions {
    pub build: BuildOptions,
    /// Ad-hoc worker-level config applied on top of tenant and defaults.
    pub overrides: Option<ConfigBundle>,
}

/// Build provenance reported by an ephemeral run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    pub fingerprint: String,
    pub main_module: String,
    pub module_count: usize,
    pub warnings: Vec<String>,
}

/// Wall-clock phases of an ephemeral run, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTiming {
    pub build_time: u64,
    pub load_time: u64,
    pub run_time: u64,
    pub total: u64,
    /// True when the bundle came from the fingerprint cache.
    pub cached: bool,
}

/// Everything an ephemeral run returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub build_info: BuildInfo,
    pub response: GatewayResponse,
    /// Summary of a worker runtime failure, when one was detected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_error: Option<String>,
    pub timing: RunTiming,
}

/// Arguments for creating a worker from a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FromTemplate {
    pub worker_id: String,
    /// Slot values; omitted slots fall back to their declared defaults.
    #[serde(default)]
    pub slots: std::collections::BTreeMap<String, String>,
    /// Config applied over the template's defaults.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overrides: Option<ConfigPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildOptions>,
}

/// Response header a runtime sets when tenant code raised.
const WORKER_ERROR_HEADER: &str = "x-worker-error";

/// The Kiln control plane.
pub struct Platform {
    stores: PlatformStores,
    bundle_cache: BundleCache,
    loader: Arc<dyn Loader>,
    stubs: StubCache,
    hostname_index: HostnameIndex,
    /// In-memory copy of the persisted defaults, reloaded on update.
    defaults: RwLock<ConfigBundle>,
}

impl Platform {
    /// Wire up a platform over the given stores, bundler, and loader.
    /// Loads persisted defaults (absent means empty).
    pub async fn new(
        stores: PlatformStores,
        bundler: Arc<dyn Bundler>,
        loader: Arc<dyn Loader>,
    ) -> Result<Self> {
        let defaults = stores.defaults.get().await?.unwrap_or_default();
        let bundle_cache = BundleCache::new(stores.bundles.clone(), bundler);
        let hostname_index = HostnameIndex::new(stores.hostnames.clone(), stores.workers.clone());
        Ok(Self {
            stores,
            bundle_cache,
            loader,
            stubs: StubCache::new(),
            hostname_index,
            defaults: RwLock::new(defaults),
        })
    }

    // ── Defaults ───────────────────────────────────────────────────

    pub async fn get_defaults(&self) -> ConfigBundle {
        self.defaults.read().await.clone()
    }

    /// Merge a patch into the persisted defaults. The write lands before
    /// any cache invalidation; every stub is dropped afterwards.
    pub async fn update_defaults(&self, patch: ConfigPatch) -> Result<ConfigBundle> {
        let mut merged = self.defaults.read().await.clone();
        patch.apply(&mut merged);
        self.stores.defaults.put(&merged).await?;
        *self.defaults.write().await = merged.clone();
        self.stubs.clear();
        info!("platform defaults updated, all stubs invalidated");
        Ok(merged)
    }

    // ── Tenants ────────────────────────────────────────────────────

    pub async fn create_tenant(&self, spec: TenantSpec) -> Result<TenantRecord> {
        validate_id("tenant", &spec.id)?;
        if self.stores.tenants.get(&spec.id).await?.is_some() {
            return Err(Error::Conflict(format!("tenant {} already exists", spec.id)));
        }
        let now = Utc::now();
        let record = TenantRecord {
            id: spec.id.clone(),
            config: spec.config,
            created_at: now,
            updated_at: now,
        };
        self.stores.tenants.put(&spec.id, &record).await?;
        info!(tenant = %spec.id, "tenant created");
        Ok(record)
    }

    pub async fn get_tenant(&self, id: &str) -> Result<TenantRecord> {
        self.stores
            .tenants
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found("tenant", id))
    }

    pub async fn list_tenants(&self, opts: ListOptions) -> Result<Page<TenantRecord>> {
        self.stores.tenants.list(opts).await
    }

    /// Replace config fields and bump `updated_at`; the tenant's stub
    /// cache entries are dropped after the write.
    pub async fn update_tenant(&self, id: &str, patch: ConfigPatch) -> Result<TenantRecord> {
        let mut record = self.get_tenant(id).await?;
        patch.apply(&mut record.config);
        record.updated_at = Utc::now();
        self.stores.tenants.put(id, &record).await?;
        self.stubs.invalidate_tenant(id);
        debug!(tenant = %id, "tenant updated");
        Ok(record)
    }

    /// Cascade delete: every worker first (each dropping its bundles and
    /// hostname routes), then the tenant record. Interruptions leave a
    /// state this call can be re-invoked on.
    pub async fn delete_tenant(&self, id: &str) -> Result<()> {
        self.get_tenant(id).await?;

        loop {
            let page = self
                .stores
                .workers
                .list(id, ListOptions::default())
                .await?;
            if page.items.is_empty() {
                break;
            }
            for worker in &page.items {
                self.delete_worker(id, &worker.id).await?;
            }
        }

        self.stores.tenants.delete(id).await?;
        self.stubs.invalidate_tenant(id);
        info!(tenant = %id, "tenant deleted");
        Ok(())
    }

    // ── Workers ────────────────────────────────────────────────────

    /// Create a worker: compile (which also caches the artifact by
    /// fingerprint), write the bundle at version 1, then the record, then
    /// bind hostnames. A hostname conflict rolls back the routes written
    /// by this call and fails loud.
    pub async fn create_worker(
        &self,
        tenant_id: &str,
        spec: WorkerSpec,
        opts: Option<&BuildOptions>,
    ) -> Result<WorkerRecord> {
        validate_id("worker", &spec.id)?;
        self.get_tenant(tenant_id).await?;
        if self
            .stores
            .workers
            .get(tenant_id, &spec.id)
            .await?
            .is_some()
        {
            return Err(Error::Conflict(format!(
                "worker {} already exists",
                worker_key(tenant_id, &spec.id)
            )));
        }
        if spec.files.is_empty() {
            return Err(Error::Validation("worker files must not be empty".to_string()));
        }

        let options = opts.cloned().unwrap_or_default();
        let built = self.bundle_cache.get_or_build(&spec.files, &options).await?;

        let now = Utc::now();
        let bundle = versioned(built, 1, now);
        self.stores
            .bundles
            .put(tenant_id, &spec.id, 1, &bundle)
            .await?;

        // Record lands only after its bundle (coherence invariant).
        let record = WorkerRecord {
            tenant_id: tenant_id.to_string(),
            id: spec.id.clone(),
            config: spec.config,
            files: spec.files,
            hostnames: BTreeSet::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        };
        self.stores
            .workers
            .put(tenant_id, &spec.id, &record)
            .await?;

        if !spec.hostnames.is_empty() {
            self.hostname_index
                .add(tenant_id, &spec.id, &spec.hostnames)
                .await?;
        }

        info!(worker = %record.table_key(), "worker created");
        self.get_worker(tenant_id, &spec.id).await
    }

    pub async fn get_worker(&self, tenant_id: &str, worker_id: &str) -> Result<WorkerRecord> {
        self.stores
            .workers
            .get(tenant_id, worker_id)
            .await?
            .ok_or_else(|| Error::not_found("worker", worker_key(tenant_id, worker_id)))
    }

    pub async fn list_workers(
        &self,
        tenant_id: &str,
        opts: ListOptions,
    ) -> Result<Page<WorkerRecord>> {
        self.get_tenant(tenant_id).await?;
        self.stores.workers.list(tenant_id, opts).await
    }

    /// Update a worker: merge the patch, rebuild, write the bundle at
    /// `version + 1` before the record, reconcile hostname routes, and
    /// drop the stub cache entry.
    pub async fn update_worker(
        &self,
        tenant_id: &str,
        worker_id: &str,
        patch: WorkerPatch,
        opts: Option<&BuildOptions>,
    ) -> Result<WorkerRecord> {
        let current = self.get_worker(tenant_id, worker_id).await?;

        let mut config = current.config.clone();
        patch.config.apply(&mut config);
        let files = patch.files.unwrap_or_else(|| current.files.clone());
        if files.is_empty() {
            return Err(Error::Validation("worker files must not be empty".to_string()));
        }

        let options = opts.cloned().unwrap_or_default();
        let built = self.bundle_cache.get_or_build(&files, &options).await?;

        let new_version = current.version + 1;
        let now = Utc::now();
        let bundle = versioned(built, new_version, now);
        self.stores
            .bundles
            .put(tenant_id, worker_id, new_version, &bundle)
            .await?;

        let record = WorkerRecord {
            config,
            files,
            version: new_version,
            updated_at: now,
            // Hostname set is reconciled through the index below.
            hostnames: current.hostnames.clone(),
            ..current.clone()
        };
        self.stores
            .workers
            .put(tenant_id, worker_id, &record)
            .await?;
        self.stubs.invalidate(tenant_id, worker_id);

        if let Some(desired) = patch.hostnames {
            let desired: BTreeSet<String> = desired
                .iter()
                .map(|h| kiln_core::canonical_hostname(h))
                .collect();
            let to_remove: Vec<&String> =
                current.hostnames.difference(&desired).collect();
            let to_add: Vec<&String> = desired.difference(&current.hostnames).collect();
            if !to_remove.is_empty() {
                self.hostname_index
                    .remove(tenant_id, worker_id, to_remove)
                    .await?;
            }
            if !to_add.is_empty() {
                self.hostname_index.add(tenant_id, worker_id, to_add).await?;
            }
        }

        debug!(worker = %worker_key(tenant_id, worker_id), version = new_version, "worker updated");
        self.get_worker(tenant_id, worker_id).await
    }

    /// Delete a worker: hostname routes and bundles concurrently, then the
    /// record, then the stub cache entry.
    pub async fn delete_worker(&self, tenant_id: &str, worker_id: &str) -> Result<()> {
        self.get_worker(tenant_id, worker_id).await?;

        let (routes, bundles) = tokio::join!(
            self.hostname_index.delete_by_worker(tenant_id, worker_id),
            self.stores.bundles.delete_all(tenant_id, worker_id),
        );
        routes?;
        bundles?;

        self.stores.workers.delete(tenant_id, worker_id).await?;
        self.stubs.invalidate(tenant_id, worker_id);
        info!(worker = %worker_key(tenant_id, worker_id), "worker deleted");
        Ok(())
    }

    // ── Dispatch ───────────────────────────────────────────────────

    /// Dispatch a request to a worker, loading a stub if the cached one is
    /// missing or stale.
    pub async fn fetch(
        &self,
        tenant_id: &str,
        worker_id: &str,
        req: GatewayRequest,
        entrypoint: Option<&str>,
    ) -> Result<GatewayResponse> {
        let stub = self.stub_for(tenant_id, worker_id).await?;
        let fetcher = stub.get_entrypoint(entrypoint)?;
        fetcher.dispatch(req).await
    }

    /// Resolve the stub for a worker, version-guarded by its record.
    async fn stub_for(&self, tenant_id: &str, worker_id: &str) -> Result<Arc<dyn Stub>> {
        let (tenant, worker) = tokio::join!(
            self.stores.tenants.get(tenant_id),
            self.stores.workers.get(tenant_id, worker_id),
        );
        let tenant = tenant?.ok_or_else(|| Error::not_found("tenant", tenant_id))?;
        let worker =
            worker?.ok_or_else(|| Error::not_found("worker", worker_key(tenant_id, worker_id)))?;

        if let Some(entry) = self.stubs.get(tenant_id, worker_id) {
            if entry.version == worker.version {
                return Ok(entry.stub);
            }
        }

        let defaults = self.defaults.read().await.clone();
        let config = resolve(&defaults, &tenant.config, Some(&worker.config));
        let name = format!("{tenant_id}:{worker_id}:v{}", worker.version);
        let cold_start = VersionedColdStart {
            bundles: self.stores.bundles.clone(),
            tenant_id: tenant_id.to_string(),
            worker_id: worker_id.to_string(),
            version: worker.version,
            config,
        };

        let stub = self.loader.get(&name, Box::new(cold_start)).await?;
        // Last-writer-wins; all stubs for one version are equivalent.
        self.stubs
            .insert(tenant_id, worker_id, worker.version, stub.clone());
        Ok(stub)
    }

    /// Build and dispatch ad-hoc source with no persisted worker record.
    /// Cached by fingerprint only.
    pub async fn run_ephemeral(
        &self,
        tenant_id: Option<&str>,
        files: &FileMap,
        req: GatewayRequest,
        opts: RunOptions,
    ) -> Result<RunOutcome> {
        let started = Instant::now();

        let tenant_config = match tenant_id {
            Some(id) => self.get_tenant(id).await?.config,
            None => ConfigBundle::default(),
        };
        let defaults = self.defaults.read().await.clone();
        let config = resolve(&defaults, &tenant_config, opts.overrides.as_ref());

        let build_started = Instant::now();
        let built = self.bundle_cache.get_or_build(files, &opts.build).await?;
        let build_time = elapsed_ms(build_started);

        let name = match tenant_id {
            Some(id) => format!("{id}:ephemeral:{}", built.fingerprint),
            None => format!("ephemeral:{}", built.fingerprint),
        };
        let build_info = BuildInfo {
            fingerprint: built.fingerprint.clone(),
            main_module: built.bundle.main_module.clone(),
            module_count: built.bundle.modules.len(),
            warnings: built.warnings.clone(),
        };
        let cached = built.cached;

        let load_started = Instant::now();
        let cold_start = EphemeralColdStart {
            bundles: self.stores.bundles.clone(),
            fingerprint: built.fingerprint,
            config,
        };
        let stub = self.loader.get(&name, Box::new(cold_start)).await?;
        let load_time = elapsed_ms(load_started);

        let run_started = Instant::now();
        let response = stub.get_entrypoint(None)?.dispatch(req).await?;
        let run_time = elapsed_ms(run_started);

        let worker_error = response.headers.get(WORKER_ERROR_HEADER).cloned();
        if let Some(error) = &worker_error {
            warn!(loader = %name, error = %error, "worker raised during ephemeral run");
        }

        Ok(RunOutcome {
            build_info,
            response,
            worker_error,
            timing: RunTiming {
                build_time,
                load_time,
                run_time,
                total: elapsed_ms(started),
                cached,
            },
        })
    }

    /// Route a request by its hostname. `None` when the request carries no
    /// host or no binding exists.
    pub async fn route(&self, req: GatewayRequest) -> Result<Option<GatewayResponse>> {
        let Some(host) = req.host() else {
            return Ok(None);
        };
        let Some(route) = self.hostname_index.resolve(&host).await? else {
            return Ok(None);
        };
        self.fetch(&route.tenant_id, &route.worker_id, req, None)
            .await
            .map(Some)
    }

    /// Resolve a hostname without dispatching.
    pub async fn resolve_hostname(&self, hostname: &str) -> Result<Option<kiln_core::HostnameRoute>> {
        self.hostname_index.resolve(hostname).await
    }

    // ── Templates ──────────────────────────────────────────────────

    /// Persist a template after enforcing slot closure.
    pub async fn register_template(&self, template: TemplateRecord) -> Result<TemplateRecord> {
        validate_id("template", &template.id)?;
        kiln_template::validate_template(&template)?;
        if self.stores.templates.get(&template.id).await?.is_some() {
            return Err(Error::Conflict(format!(
                "template {} already exists",
                template.id
            )));
        }
        self.stores.templates.put(&template.id, &template).await?;
        info!(template = %template.id, "template registered");
        Ok(template)
    }

    /// Replace a template; the path id wins over the body's.
    pub async fn update_template(
        &self,
        id: &str,
        mut template: TemplateRecord,
    ) -> Result<TemplateRecord> {
        self.get_template(id).await?;
        template.id = id.to_string();
        kiln_template::validate_template(&template)?;
        self.stores.templates.put(id, &template).await?;
        Ok(template)
    }

    pub async fn get_template(&self, id: &str) -> Result<TemplateRecord> {
        self.stores
            .templates
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found("template", id))
    }

    pub async fn delete_template(&self, id: &str) -> Result<()> {
        if !self.stores.templates.delete(id).await? {
            return Err(Error::not_found("template", id));
        }
        Ok(())
    }

    pub async fn list_templates(&self, opts: ListOptions) -> Result<Page<TemplateMetadata>> {
        let page = self.stores.templates.list(opts).await?;
        Ok(Page {
            items: page.items.iter().map(TemplateRecord::metadata).collect(),
            cursor: page.cursor,
        })
    }

    /// Interpolate a template and create an ordinary worker from it. The
    /// new worker keeps no reference back to the template.
    pub async fn create_worker_from_template(
        &self,
        tenant_id: &str,
        template_id: &str,
        args: FromTemplate,
    ) -> Result<WorkerRecord> {
        let template = self.get_template(template_id).await?;
        let files = kiln_template::interpolate(&template.files, &template.slots, &args.slots)?;

        let mut config = template.defaults.clone().unwrap_or_default();
        if let Some(overrides) = &args.overrides {
            overrides.apply(&mut config);
        }

        let spec = WorkerSpec {
            id: args.worker_id,
            config,
            files,
            hostnames: BTreeSet::new(),
        };
        self.create_worker(tenant_id, spec, args.build.as_ref())
            .await
    }

    /// Interpolation only; nothing is written.
    pub async fn preview_template_files(
        &self,
        template_id: &str,
        slots: &std::collections::BTreeMap<String, String>,
    ) -> Result<FileMap> {
        let template = self.get_template(template_id).await?;
        kiln_template::preview(&template, slots)
    }
}

/// Re-key a cache build as a versioned bundle.
fn versioned(built: BuiltBundle, version: u64, built_at: DateTime<Utc>) -> Bundle {
    Bundle {
        version,
        built_at,
        ..built.bundle
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Ids are ASCII and URL-safe; the key separator `:` is never allowed.
fn validate_id(what: &str, id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if !ok {
        return Err(Error::Validation(format!("invalid {what} id: {id:?}")));
    }
    Ok(())
}
