pub mod config;
pub mod error;
pub mod state;
pub mod status;
pub mod system;
pub mod tools;

use axum::{
    Json, Router,
    routing::{get, post},
};
use serde::Serialize;

use crate::{state::AppState, tools::{acfs, auto_claude, automaker, continuous_claude}};

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/status", get(status::get_status))
        .route("/api/system", get(system::get_system))
        .route(
            "/api/tools/acfs",
            get(acfs::status)
                .post(acfs::action)
                .delete(acfs::kill_session),
        )
        .route(
            "/api/tools/continuous-claude",
            post(continuous_claude::start).delete(continuous_claude::stop),
        )
        .route(
            "/api/tools/auto-claude",
            post(auto_claude::start).delete(auto_claude::stop),
        )
        .route(
            "/api/tools/automaker",
            post(automaker::start).delete(automaker::stop),
        )
        .with_state(state)
}
