//! API layer -- axum routes, the websocket endpoint and error mapping.

pub mod error;
mod routes;
pub mod state;
mod ws;

use self::error::ApiError;
use self::state::AppState;
use axum::{routing::get, Router};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .route("/ws", get(ws::ws_handler))
        .fallback(fallback)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                // Dashboards are served from other origins.
                .layer(CorsLayer::permissive()),
        )
}

async fn fallback() -> ApiError {
    ApiError::NotFound("not found".into())
}
