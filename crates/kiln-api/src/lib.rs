//! kiln-api — REST API for the Kiln control plane.
//!
//! Thin axum handlers over the [`Platform`](kiln_platform::Platform)
//! façade; every route delegates and maps error kinds to status codes.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/defaults` | Current platform defaults |
//! | PUT | `/api/defaults` | Merge and persist defaults |
//! | GET | `/api/tenants` | Paginated tenant list |
//! | POST | `/api/tenants` | Create a tenant |
//! | GET | `/api/tenants/{id}` | Get a tenant |
//! | PUT | `/api/tenants/{id}` | Update a tenant |
//! | DELETE | `/api/tenants/{id}` | Delete a tenant (cascades) |
//! | GET | `/api/tenants/{id}/workers` | List workers |
//! | POST | `/api/tenants/{id}/workers` | Create a worker |
//! | GET | `/api/tenants/{id}/workers/{wid}` | Get a worker |
//! | PUT | `/api/tenants/{id}/workers/{wid}` | Update a worker |
//! | DELETE | `/api/tenants/{id}/workers/{wid}` | Delete a worker |
//! | POST | `/api/tenants/{id}/workers/{wid}/fetch` | Dispatch a request |
//! | POST | `/api/run` | Ephemeral build-and-dispatch |
//! | GET | `/api/templates` | List templates |
//! | POST | `/api/templates` | Register a template |
//! | GET | `/api/templates/{id}` | Get a template |
//! | PUT | `/api/templates/{id}` | Update a template |
//! | DELETE | `/api/templates/{id}` | Delete a template |
//! | POST | `/api/templates/{id}/generate` | Preview interpolated files |

pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use kiln_platform::Platform;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub platform: Arc<Platform>,
}

/// Build the complete API router.
pub fn build_router(platform: Arc<Platform>) -> Router {
    let state = ApiState { platform };

    let api_routes = Router::new()
        .route(
            "/defaults",
            get(handlers::get_defaults).put(handlers::update_defaults),
        )
        .route(
            "/tenants",
            get(handlers::list_tenants).post(handlers::create_tenant),
        )
        .route(
            "/tenants/{id}",
            get(handlers::get_tenant)
                .put(handlers::update_tenant)
                .delete(handlers::delete_tenant),
        )
        .route(
            "/tenants/{id}/workers",
            get(handlers::list_workers).post(handlers::create_worker),
        )
        .route(
            "/tenants/{id}/workers/{wid}",
            get(handlers::get_worker)
                .put(handlers::update_worker)
                .delete(handlers::delete_worker),
        )
        .route(
            "/tenants/{id}/workers/{wid}/fetch",
            post(handlers::fetch_worker),
        )
        .route("/run", post(handlers::run_ephemeral))
        .route(
            "/templates",
            get(handlers::list_templates).post(handlers::register_template),
        )
        .route(
            "/templates/{id}",
            get(handlers::get_template)
                .put(handlers::update_template)
                .delete(handlers::delete_template),
        )
        .route("/templates/{id}/generate", post(handlers::generate_template));

    Router::new().nest("/api", api_routes).with_state(state)
}
