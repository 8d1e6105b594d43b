//! Contracts for the opaque worker runtime.
//!
//! The runtime that actually executes compiled modules is an external
//! collaborator. The core hands it a *loader name* and a cold-start
//! carrier, receives an opaque [`Stub`], and dispatches requests through
//! [`Fetcher`]s obtained from it. The core never inspects a stub.
//!
//! Cold starts may run at any time (the loader's own cache is orthogonal
//! to ours), so the carriers here are idempotent: they only read a bundle
//! from the store and assemble a descriptor.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use kiln_core::{
    EffectiveConfig, Error, FileMap, GatewayRequest, GatewayResponse, Limits, Result,
};
use kiln_store::BundleStore;

/// Everything the runtime needs to instantiate a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerDescriptor {
    pub main_module: String,
    pub modules: FileMap,
    pub compatibility_date: String,
    pub compatibility_flags: Vec<String>,
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<Limits>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_outbound: Option<String>,
    pub tails: Vec<String>,
}

impl WorkerDescriptor {
    /// Assemble a descriptor from a compiled bundle and resolved config.
    pub fn from_parts(main_module: String, modules: FileMap, config: EffectiveConfig) -> Self {
        Self {
            main_module,
            modules,
            compatibility_date: config.compatibility_date,
            compatibility_flags: config.compatibility_flags,
            env: config.env,
            limits: config.limits,
            global_outbound: config.global_outbound,
            tails: config.tails,
        }
    }
}

/// Produces the descriptor for a cold start.
#[async_trait]
pub trait ColdStart: Send + Sync {
    async fn prepare(&self) -> Result<WorkerDescriptor>;
}

/// Dispatches one request into a loaded worker.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn dispatch(&self, req: GatewayRequest) -> Result<GatewayResponse>;
}

/// Opaque handle to a loaded worker.
pub trait Stub: Send + Sync {
    /// Obtain a dispatchable entrypoint; `None` selects the default export.
    fn get_entrypoint(&self, name: Option<&str>) -> Result<Box<dyn Fetcher>>;
}

/// The opaque runtime loader.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Return a stub for `name`, running `cold_start` if the runtime has
    /// no live instance under that name.
    async fn get(&self, name: &str, cold_start: Box<dyn ColdStart>) -> Result<Arc<dyn Stub>>;
}

/// Cold start for a versioned worker: reads the bundle at
/// `(tenant, worker, version)`. The bundle must already exist — cold
/// starts never rebuild.
pub struct VersionedColdStart {
    pub bundles: Arc<dyn BundleStore>,
    pub tenant_id: String,
    pub worker_id: String,
    pub version: u64,
    pub config: EffectiveConfig,
}

#[async_trait]
impl ColdStart for VersionedColdStart {
    async fn prepare(&self) -> Result<WorkerDescriptor> {
        let bundle = self
            .bundles
            .get(&self.tenant_id, &self.worker_id, self.version)
            .await?
            .ok_or_else(|| {
                Error::Loader(format!(
                    "missing bundle {}:{}:v{}",
                    self.tenant_id, self.worker_id, self.version
                ))
            })?;
        Ok(WorkerDescriptor::from_parts(
            bundle.main_module,
            bundle.modules,
            self.config.clone(),
        ))
    }
}

/// Cold start for an ephemeral run: reads the fingerprint-keyed bundle.
pub struct EphemeralColdStart {
    pub bundles: Arc<dyn BundleStore>,
    pub fingerprint: String,
    pub config: EffectiveConfig,
}

#[async_trait]
impl ColdStart for EphemeralColdStart {
    async fn prepare(&self) -> Result<WorkerDescriptor> {
        let bundle = self
            .bundles
            .get_fingerprint(&self.fingerprint)
            .await?
            .ok_or_else(|| {
                Error::Loader(format!("missing bundle for fingerprint {}", self.fingerprint))
            })?;
        Ok(WorkerDescriptor::from_parts(
            bundle.main_module,
            bundle.modules,
            self.config.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kiln_core::Bundle;
    use kiln_store::MemoryStores;

    fn test_config() -> EffectiveConfig {
        EffectiveConfig {
            env: BTreeMap::from([("KEY".to_string(), "value".to_string())]),
            compatibility_date: "2026-01-24".to_string(),
            compatibility_flags: vec!["flag_a".to_string()],
            limits: None,
            tails: vec!["audit".to_string()],
            global_outbound: None,
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
    async fn versioned_cold_start_assembles_descriptor() {
        let stores = Arc::new(MemoryStores::new());
        BundleStore::put(stores.as_ref(), "acme", "api", 1, &test_bundle(1))
            .await
            .unwrap();

        let cold = VersionedColdStart {
            bundles: stores,
            tenant_id: "acme".to_string(),
            worker_id: "api".to_string(),
            version: 1,
            config: test_config(),
        };
        let descriptor = cold.prepare().await.unwrap();
        assert_eq!(descriptor.main_module, "src/index.ts");
        assert_eq!(descriptor.env.get("KEY").map(String::as_str), Some("value"));
        assert_eq!(descriptor.tails, vec!["audit"]);
    }

    #[tokio::test]
    async fn versioned_cold_start_fails_without_bundle() {
        let cold = VersionedColdStart {
            bundles: Arc::new(MemoryStores::new()),
            tenant_id: "acme".to_string(),
            worker_id: "api".to_string(),
            version: 7,
            config: test_config(),
        };
        let err = cold.prepare().await.unwrap_err();
        assert_eq!(err.kind(), kiln_core::ErrorKind::Loader);
        assert!(err.to_string().contains("acme:api:v7"));
    }

    #[tokio::test]
    async fn ephemeral_cold_start_reads_fingerprint_family() {
        let stores = Arc::new(MemoryStores::new());
        BundleStore::put_fingerprint(stores.as_ref(), "ab12cd34ef56ab12", &test_bundle(0), None)
            .await
            .unwrap();

        let cold = EphemeralColdStart {
            bundles: stores,
            fingerprint: "ab12cd34ef56ab12".to_string(),
            config: test_config(),
        };
        assert!(cold.prepare().await.is_ok());

        let missing = EphemeralColdStart {
            bundles: Arc::new(MemoryStores::new()),
            fingerprint: "ab12cd34ef56ab12".to_string(),
            config: test_config(),
        };
        assert_eq!(
            missing.prepare().await.unwrap_err().kind(),
            kiln_core::ErrorKind::Loader
        );
    }
}
