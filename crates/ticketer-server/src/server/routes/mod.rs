//! HTTP routes under `/api/v1`.
//!
//! - `POST /tickets/generate` issues one ticket.
//! - `POST /tickets/generate-batch` issues `count` contiguous tickets.
//! - `GET /health-check` reports liveness.
//!
//! Ticket values and range ids are serialized as decimal strings so values
//! past 2^53 survive JSON consumers that parse numbers as doubles.

pub mod health;
pub mod tickets;

use super::middleware;
use axum::Router;
use axum::http::HeaderValue;
use axum::routing::{get, post};
use std::sync::Arc;
use ticketer::{Allocator, RangeStore};
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::Level;

/// State shared by every handler.
pub struct AppState<S> {
    pub allocator: Arc<Allocator<S>>,
    /// Identifier of the ticket database, echoed in responses.
    pub database_id: i64,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            allocator: Arc::clone(&self.allocator),
            database_id: self.database_id,
        }
    }
}

impl<S: RangeStore> AppState<S> {
    pub fn new(allocator: Allocator<S>, database_id: i64) -> Self {
        Self {
            allocator: Arc::new(allocator),
            database_id,
        }
    }
}

/// Builds the full application, middleware included.
pub fn router<S>(state: AppState<S>, cors_origin: Option<HeaderValue>) -> Router
where
    S: RangeStore + 'static,
{
    let tickets = Router::new()
        .route("/generate", post(tickets::generate::<S>))
        .route("/generate-batch", post(tickets::generate_batch::<S>));

    let api = Router::new()
        .nest("/tickets", tickets)
        .route("/health-check", get(health::health_check));

    let app = Router::new().nest("/api/v1", api).with_state(state);

    let app = middleware::security_headers()
        .into_iter()
        .fold(app, |app, header| app.layer(header));

    app.layer(
        TraceLayer::new_for_http()
            .make_span_with(middleware::make_span)
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
    .layer(middleware::propagate_request_id())
    .layer(middleware::set_request_id())
    .layer(middleware::cors(cors_origin))
}
