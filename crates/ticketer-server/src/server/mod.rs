//! HTTP service for ticket allocation.
//!
//! ## Structure
//!
//! - [`config`] - CLI and environment configuration.
//! - [`routes`] - axum handlers and the application router.
//! - [`error`] - mapping of allocation errors onto HTTP responses.
//! - [`middleware`] - request ids, CORS, security headers, request spans.
//! - [`telemetry`] - logging and optional OpenTelemetry export.

pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod telemetry;
