//! Application setup and router construction.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::Method;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::metrics::Metrics;
use crate::server::middleware::auth_middleware;
use crate::server::routes::{health, jobs, metrics, nodes, results, tenants};
use crate::store::Store;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub metrics: Arc<Metrics>,
    pub auth_tokens: HashMap<String, String>,
    pub admin_token: Option<String>,
}

/// Build the Axum application router.
///
/// `/health` and `/metrics` are unauthenticated; everything else sits behind
/// the bearer-token middleware.
pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    let protected = Router::new()
        // Jobs
        .route("/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route("/jobs/next", get(jobs::next_job))
        .route("/jobs/:id", get(jobs::get_job).delete(jobs::delete_job))
        .route("/jobs/:id/pause", post(jobs::pause_job))
        .route("/jobs/:id/resume", post(jobs::resume_job))
        .route("/jobs/:id/cancel", post(jobs::cancel_job))
        .route("/jobs/:id/start", post(jobs::start_job))
        .route("/jobs/:id/heartbeat", post(jobs::job_heartbeat))
        // Nodes
        .route("/nodes/register", post(nodes::register_node))
        .route("/nodes/:id/heartbeat", post(nodes::node_heartbeat))
        .route("/nodes/:id/drain", post(nodes::drain_node))
        // Results
        .route("/results", post(results::report_result))
        // Tenant admin
        .route("/tenants", post(tenants::create_tenant).get(tenants::list_tenants))
        .route(
            "/tenants/:id",
            get(tenants::get_tenant)
                .put(tenants::update_tenant)
                .delete(tenants::delete_tenant),
        )
        .route("/tenants/:id/stats", get(tenants::tenant_stats))
        .route("/tenants/:id/jobs", get(tenants::tenant_jobs))
        .route("/tenants/:id/nodes", get(tenants::tenant_nodes))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .merge(protected)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
