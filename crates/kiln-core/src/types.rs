//! Domain types for the Kiln control plane.
//!
//! These types represent the persisted state of tenants, workers, compiled
//! bundles, hostname routes, and templates, plus the gateway-level request
//! and response shapes dispatched to worker stubs. All types serialize to
//! camelCase JSON, matching the REST surface.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a tenant (ASCII, URL-safe).
pub type TenantId = String;

/// Identifier for a worker, unique within its tenant.
pub type WorkerId = String;

/// Source and compiled file maps: path → content.
pub type FileMap = BTreeMap<String, String>;

// ── Config ─────────────────────────────────────────────────────────

/// Per-instance resource limits. Undefined sub-fields inherit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subrequests: Option<u64>,
}

impl Limits {
    /// True when no sub-field is set.
    pub fn is_empty(&self) -> bool {
        self.cpu_ms.is_none() && self.subrequests.is_none()
    }
}

/// The configuration bundle shared by platform defaults, tenant config,
/// worker config, and template defaults (the "Tenant minus id" shape).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigBundle {
    /// Environment bindings injected into the worker.
    pub env: BTreeMap<String, String>,
    /// Opaque compatibility date; first-defined wins during resolution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compatibility_date: Option<String>,
    /// Ordered compatibility flags; duplicates are dropped downstream.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub compatibility_flags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<Limits>,
    /// Tail-worker references, invoked post-execution with trace records.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tails: Vec<String>,
    /// Outbound-interceptor reference passed through to the loader.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_outbound: Option<String>,
}

/// Partial update for a [`ConfigBundle`]; `None` keeps the current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigPatch {
    pub env: Option<BTreeMap<String, String>>,
    pub compatibility_date: Option<String>,
    pub compatibility_flags: Option<Vec<String>>,
    pub limits: Option<Limits>,
    pub tails: Option<Vec<String>>,
    pub global_outbound: Option<String>,
}

impl ConfigPatch {
    /// Apply this patch over `base`, replacing only the fields that are set.
    pub fn apply(&self, base: &mut ConfigBundle) {
        if let Some(env) = &self.env {
            base.env = env.clone();
        }
        if let Some(date) = &self.compatibility_date {
            base.compatibility_date = Some(date.clone());
        }
        if let Some(flags) = &self.compatibility_flags {
            base.compatibility_flags = flags.clone();
        }
        if let Some(limits) = &self.limits {
            base.limits = Some(limits.clone());
        }
        if let Some(tails) = &self.tails {
            base.tails = tails.clone();
        }
        if let Some(outbound) = &self.global_outbound {
            base.global_outbound = Some(outbound.clone());
        }
    }

    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        self.env.is_none()
            && self.compatibility_date.is_none()
            && self.compatibility_flags.is_none()
            && self.limits.is_none()
            && self.tails.is_none()
            && self.global_outbound.is_none()
    }
}

/// The resolved configuration actually passed to the loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveConfig {
    pub env: BTreeMap<String, String>,
    pub compatibility_date: String,
    pub compatibility_flags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<Limits>,
    pub tails: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_outbound: Option<String>,
}

// ── Tenants ────────────────────────────────────────────────────────

/// A tenant: logical owner of workers, defines default config for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantRecord {
    pub id: TenantId,
    #[serde(flatten)]
    pub config: ConfigBundle,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields required to create a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantSpec {
    pub id: TenantId,
    #[serde(flatten)]
    pub config: ConfigBundle,
}

// ── Workers ────────────────────────────────────────────────────────

/// A worker: one compilable, addressable unit inside a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRecord {
    pub tenant_id: TenantId,
    pub id: WorkerId,
    #[serde(flatten)]
    pub config: ConfigBundle,
    /// Source tree: path → content. Never empty.
    pub files: FileMap,
    /// Hostnames bound to this worker.
    #[serde(skip_serializing_if = "BTreeSet::is_empty", default)]
    pub hostnames: BTreeSet<String>,
    /// Monotonically increasing, starts at 1.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerRecord {
    /// Composite key for the workers table.
    pub fn table_key(&self) -> String {
        worker_key(&self.tenant_id, &self.id)
    }
}

/// Composite key for a worker: `{tenant_id}:{worker_id}`.
pub fn worker_key(tenant_id: &str, worker_id: &str) -> String {
    format!("{tenant_id}:{worker_id}")
}

/// Fields required to create a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSpec {
    pub id: WorkerId,
    #[serde(flatten)]
    pub config: ConfigBundle,
    pub files: FileMap,
    #[serde(default)]
    pub hostnames: BTreeSet<String>,
}

/// Partial update for a worker; unset fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerPatch {
    #[serde(flatten)]
    pub config: ConfigPatch,
    pub files: Option<FileMap>,
    pub hostnames: Option<BTreeSet<String>>,
}

// ── Bundles ────────────────────────────────────────────────────────

/// The compiled form of a worker at a specific version.
///
/// Fingerprint-cached ephemeral bundles use `version = 0` since they are
/// not tied to any worker record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    /// Path of the entry module within `modules`.
    pub main_module: String,
    /// Compiled modules: path → content.
    pub modules: FileMap,
    pub version: u64,
    pub built_at: DateTime<Utc>,
}

/// Composite key for a versioned bundle: `{tenant_id}:{worker_id}:v{n}`.
pub fn bundle_key(tenant_id: &str, worker_id: &str, version: u64) -> String {
    format!("{tenant_id}:{worker_id}:v{version}")
}

// ── Hostname routes ────────────────────────────────────────────────

/// Exclusive binding of a hostname to one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostnameRoute {
    pub hostname: String,
    pub tenant_id: TenantId,
    pub worker_id: WorkerId,
}

/// Canonical form of a hostname key (ASCII lower-cased, port stripped).
pub fn canonical_hostname(hostname: &str) -> String {
    let host = hostname.split(':').next().unwrap_or(hostname);
    host.to_ascii_lowercase()
}

// ── Templates ──────────────────────────────────────────────────────

/// A declared slot in a template file set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
}

/// A reusable worker skeleton with `{{slot}}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub files: FileMap,
    #[serde(default)]
    pub slots: Vec<SlotSpec>,
    /// Default config applied to workers generated from this template.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defaults: Option<ConfigBundle>,
}

/// Listing projection of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    pub id: String,
    pub name: String,
    pub description: String,
    pub slot_names: Vec<String>,
}

impl TemplateRecord {
    /// Project this template into its listing metadata.
    pub fn metadata(&self) -> TemplateMetadata {
        TemplateMetadata {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            slot_names: self.slots.iter().map(|s| s.name.clone()).collect(),
        }
    }
}

// ── Gateway request / response ─────────────────────────────────────

/// A request dispatched to a worker stub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRequest {
    pub method: String,
    /// Absolute URL or bare path.
    pub url: String,
    /// Header names are stored lower-cased.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl GatewayRequest {
    /// A GET request for the given URL with no headers or body.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// Insert a header, lower-casing the name.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// The request hostname: URL authority first, `host` header second.
    pub fn host(&self) -> Option<String> {
        if let Some(rest) = self.url.split_once("://").map(|(_, rest)| rest) {
            let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
            // Strip userinfo if present.
            let host = authority.rsplit('@').next().unwrap_or(authority);
            if !host.is_empty() {
                return Some(canonical_hostname(host));
            }
        }
        self.headers.get("host").map(|h| canonical_hostname(h))
    }
}

/// A response returned by a worker stub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl GatewayResponse {
    /// A 200 response with the given body and no headers.
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            body: Some(body.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_key_is_colon_joined() {
        assert_eq!(worker_key("acme", "api"), "acme:api");
        assert_eq!(bundle_key("acme", "api", 3), "acme:api:v3");
    }

    #[test]
    fn config_patch_applies_only_set_fields() {
        let mut base = ConfigBundle {
            env: BTreeMap::from([("A".to_string(), "1".to_string())]),
            compatibility_date: Some("2026-01-01".to_string()),
            ..ConfigBundle::default()
        };
        let patch = ConfigPatch {
            env: Some(BTreeMap::from([("B".to_string(), "2".to_string())])),
            ..ConfigPatch::default()
        };
        patch.apply(&mut base);

        assert_eq!(base.env.get("B").map(String::as_str), Some("2"));
        assert!(!base.env.contains_key("A"));
        assert_eq!(base.compatibility_date.as_deref(), Some("2026-01-01"));
    }

    #[test]
    fn host_prefers_url_authority() {
        let req = GatewayRequest::get("https://App.Acme.com:8443/path?q=1")
            .with_header("Host", "other.example");
        assert_eq!(req.host().as_deref(), Some("app.acme.com"));
    }

    #[test]
    fn host_falls_back_to_header_for_bare_paths() {
        let req = GatewayRequest::get("/index").with_header("Host", "app.acme.com");
        assert_eq!(req.host().as_deref(), Some("app.acme.com"));
        assert!(GatewayRequest::get("/index").host().is_none());
    }

    #[test]
    fn records_round_trip_as_camel_case_json() {
        let record = TenantRecord {
            id: "acme".to_string(),
            config: ConfigBundle {
                compatibility_date: Some("2026-01-24".to_string()),
                ..ConfigBundle::default()
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("compatibilityDate"));
        assert!(json.contains("createdAt"));

        let back: TenantRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn template_metadata_projects_slot_names() {
        let template = TemplateRecord {
            id: "hello".to_string(),
            name: "Hello".to_string(),
            description: String::new(),
            files: BTreeMap::new(),
            slots: vec![
                SlotSpec {
                    name: "greeting".to_string(),
                    description: String::new(),
                    default: Some("hi".to_string()),
                    example: None,
                },
                SlotSpec {
                    name: "subject".to_string(),
                    description: String::new(),
                    default: None,
                    example: Some("world".to_string()),
                },
            ],
            defaults: None,
        };
        let meta = template.metadata();
        assert_eq!(meta.slot_names, vec!["greeting", "subject"]);
    }
}
