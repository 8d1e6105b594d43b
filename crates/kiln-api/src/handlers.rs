//! REST API handlers.
//!
//! Each handler delegates to the platform façade and returns JSON
//! responses. Error kinds map to status codes: 400 validation, 404 not
//! found, 409 conflict, 422 build, 500 storage/loader.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use kiln_build::BuildOptions;
use kiln_core::{
    ConfigPatch, Error, ErrorKind, FileMap, GatewayRequest, TemplateRecord, TenantSpec,
    WorkerPatch, WorkerSpec,
};
use kiln_platform::RunOptions;
use kiln_store::ListOptions;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Build => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Loader | ErrorKind::Storage | ErrorKind::Canceled => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(err: &Error) -> axum::response::Response {
    (
        status_for(err.kind()),
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(err.to_string()),
        }),
    )
        .into_response()
}

/// Pagination query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub prefix: Option<String>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

impl From<ListQuery> for ListOptions {
    fn from(query: ListQuery) -> Self {
        ListOptions {
            prefix: query.prefix,
            limit: query.limit,
            cursor: query.cursor,
        }
    }
}

/// Serializable page shape.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PageBody<T: Serialize> {
    items: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<String>,
}

impl<T: Serialize> From<kiln_store::Page<T>> for PageBody<T> {
    fn from(page: kiln_store::Page<T>) -> Self {
        Self {
            items: page.items,
            cursor: page.cursor,
        }
    }
}

// ── Defaults ───────────────────────────────────────────────────────

/// GET /api/defaults
pub async fn get_defaults(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.platform.get_defaults().await).into_response()
}

/// PUT /api/defaults
pub async fn update_defaults(
    State(state): State<ApiState>,
    Json(patch): Json<ConfigPatch>,
) -> impl IntoResponse {
    match state.platform.update_defaults(patch).await {
        Ok(defaults) => ApiResponse::ok(defaults).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Tenants ────────────────────────────────────────────────────────

/// GET /api/tenants
pub async fn list_tenants(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    match state.platform.list_tenants(query.into()).await {
        Ok(page) => ApiResponse::ok(PageBody::from(page)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /api/tenants
pub async fn create_tenant(
    State(state): State<ApiState>,
    Json(spec): Json<TenantSpec>,
) -> impl IntoResponse {
    match state.platform.create_tenant(spec).await {
        Ok(record) => (StatusCode::CREATED, ApiResponse::ok(record)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/tenants/{id}
pub async fn get_tenant(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.platform.get_tenant(&id).await {
        Ok(record) => ApiResponse::ok(record).into_response(),
        Err(e) => error_response(&e),
    }
}

/// PUT /api/tenants/{id}
pub async fn update_tenant(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(patch): Json<ConfigPatch>,
) -> impl IntoResponse {
    match state.platform.update_tenant(&id, patch).await {
        Ok(record) => ApiResponse::ok(record).into_response(),
        Err(e) => error_response(&e),
    }
}

/// DELETE /api/tenants/{id}
pub async fn delete_tenant(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.platform.delete_tenant(&id).await {
        Ok(()) => ApiResponse::ok("deleted").into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Workers ────────────────────────────────────────────────────────

/// GET /api/tenants/{id}/workers
pub async fn list_workers(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    match state.platform.list_workers(&id, query.into()).await {
        Ok(page) => ApiResponse::ok(PageBody::from(page)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Worker creation body: a spec plus optional build options.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkerBody {
    #[serde(flatten)]
    pub spec: WorkerSpec,
    pub build: Option<BuildOptions>,
}

/// POST /api/tenants/{id}/workers
pub async fn create_worker(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<CreateWorkerBody>,
) -> impl IntoResponse {
    match state
        .platform
        .create_worker(&id, body.spec, body.build.as_ref())
        .await
    {
        Ok(record) => (StatusCode::CREATED, ApiResponse::ok(record)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/tenants/{id}/workers/{wid}
pub async fn get_worker(
    State(state): State<ApiState>,
    Path((id, wid)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.platform.get_worker(&id, &wid).await {
        Ok(record) => ApiResponse::ok(record).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Worker update body: a patch plus optional build options.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWorkerBody {
    #[serde(flatten)]
    pub patch: WorkerPatch,
    pub build: Option<BuildOptions>,
}

/// PUT /api/tenants/{id}/workers/{wid}
pub async fn update_worker(
    State(state): State<ApiState>,
    Path((id, wid)): Path<(String, String)>,
    Json(body): Json<UpdateWorkerBody>,
) -> impl IntoResponse {
    match state
        .platform
        .update_worker(&id, &wid, body.patch, body.build.as_ref())
        .await
    {
        Ok(record) => ApiResponse::ok(record).into_response(),
        Err(e) => error_response(&e),
    }
}

/// DELETE /api/tenants/{id}/workers/{wid}
pub async fn delete_worker(
    State(state): State<ApiState>,
    Path((id, wid)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.platform.delete_worker(&id, &wid).await {
        Ok(()) => ApiResponse::ok("deleted").into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Dispatch ───────────────────────────────────────────────────────

/// Request shape for `/fetch`: built into a gateway request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchBody {
    pub method: Option<String>,
    pub path: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub entrypoint: Option<String>,
}

impl FetchBody {
    fn into_request(self) -> (GatewayRequest, Option<String>) {
        let mut request = GatewayRequest {
            method: self.method.unwrap_or_else(|| "GET".to_string()),
            url: self.path.unwrap_or_else(|| "/".to_string()),
            headers: BTreeMap::new(),
            body: self.body,
        };
        for (name, value) in self.headers {
            request.headers.insert(name.to_ascii_lowercase(), value);
        }
        (request, self.entrypoint)
    }
}

/// POST /api/tenants/{id}/workers/{wid}/fetch
pub async fn fetch_worker(
    State(state): State<ApiState>,
    Path((id, wid)): Path<(String, String)>,
    Json(body): Json<FetchBody>,
) -> impl IntoResponse {
    let (request, entrypoint) = body.into_request();
    match state
        .platform
        .fetch(&id, &wid, request, entrypoint.as_deref())
        .await
    {
        Ok(response) => ApiResponse::ok(response).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Body for `/api/run`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunBody {
    pub files: FileMap,
    #[serde(default)]
    pub options: Option<RunOptions>,
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub request: Option<FetchBody>,
}

/// POST /api/run
pub async fn run_ephemeral(
    State(state): State<ApiState>,
    Json(body): Json<RunBody>,
) -> impl IntoResponse {
    let (request, _) = body.request.unwrap_or_default().into_request();
    match state
        .platform
        .run_ephemeral(
            body.tenant_id.as_deref(),
            &body.files,
            request,
            body.options.unwrap_or_default(),
        )
        .await
    {
        Ok(outcome) => ApiResponse::ok(outcome).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Templates ──────────────────────────────────────────────────────

/// GET /api/templates
pub async fn list_templates(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    match state.platform.list_templates(query.into()).await {
        Ok(page) => ApiResponse::ok(PageBody::from(page)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /api/templates
pub async fn register_template(
    State(state): State<ApiState>,
    Json(template): Json<TemplateRecord>,
) -> impl IntoResponse {
    match state.platform.register_template(template).await {
        Ok(record) => (StatusCode::CREATED, ApiResponse::ok(record)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/templates/{id}
pub async fn get_template(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.platform.get_template(&id).await {
        Ok(record) => ApiResponse::ok(record).into_response(),
        Err(e) => error_response(&e),
    }
}

/// PUT /api/templates/{id}
pub async fn update_template(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(template): Json<TemplateRecord>,
) -> impl IntoResponse {
    match state.platform.update_template(&id, template).await {
        Ok(record) => ApiResponse::ok(record).into_response(),
        Err(e) => error_response(&e),
    }
}

/// DELETE /api/templates/{id}
pub async fn delete_template(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.platform.delete_template(&id).await {
        Ok(()) => ApiResponse::ok("deleted").into_response(),
        Err(e) => error_response(&e),
    }
}

/// Body for template generation: slot values only.
#[derive(Debug, Default, Deserialize)]
pub struct GenerateBody {
    #[serde(default)]
    pub slots: BTreeMap<String, String>,
}

/// POST /api/templates/{id}/generate
pub async fn generate_template(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<GenerateBody>,
) -> impl IntoResponse {
    match state.platform.preview_template_files(&id, &body.slots).await {
        Ok(files) => ApiResponse::ok(files).into_response(),
        Err(e) => error_response(&e),
    }
}
