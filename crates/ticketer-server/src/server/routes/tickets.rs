use super::AppState;
use crate::server::error::ApiError;
use crate::server::middleware::RequestId;
use crate::server::telemetry;
use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use ticketer::RangeStore;

const MAX_ID_LEN: usize = 128;

/// Why the caller needs a ticket. Only short URL generation is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    ShortUrlGeneration,
}

#[derive(Debug, Deserialize)]
pub struct RequestContext {
    pub reason: Reason,
}

#[derive(Debug, Deserialize)]
pub struct RequestMetadata {
    pub client_id: String,
    pub request_context: RequestContext,
}

#[derive(Debug, Deserialize)]
pub struct TicketRequest {
    pub service_id: String,
    pub metadata: RequestMetadata,
}

impl TicketRequest {
    fn validate(&self) -> ticketer::Result<()> {
        check_id("service_id", &self.service_id)?;
        check_id("metadata.client_id", &self.metadata.client_id)
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub count: i64,
    #[serde(flatten)]
    pub ticket: TicketRequest,
}

fn check_id(field: &str, value: &str) -> ticketer::Result<()> {
    let len = value.chars().count();
    if len == 0 || len > MAX_ID_LEN {
        return Err(ticketer::Error::invalid(format!(
            "{field} must be between 1 and {MAX_ID_LEN} characters, got {len}"
        )));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct Issued<T> {
    pub success: bool,
    pub data: T,
}

#[derive(Debug, Serialize)]
pub struct TicketData {
    pub ticket_id: String,
    pub database_id: i64,
    pub range_id: String,
    pub timestamp: i64,
    pub request_id: String,
}

#[derive(Debug, Serialize)]
pub struct BatchData {
    pub start_ticket_id: String,
    pub end_ticket_id: String,
    pub ticket_range: i64,
    pub database_id: i64,
    pub range_id: String,
    pub timestamp: i64,
    pub request_id: String,
}

type Created<T> = (StatusCode, Json<Issued<T>>);

fn parse<T>(payload: Result<Json<T>, JsonRejection>, request_id: &str) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError::new(ticketer::Error::invalid(rejection.body_text()), request_id))
}

fn observe<T>(op: &'static str, started: Instant, result: &ticketer::Result<T>) {
    let outcome = match result {
        Ok(_) => "issued",
        Err(e) => e.kind().as_str(),
    };
    telemetry::record_claim(op, outcome, started.elapsed().as_secs_f64() * 1_000.0);
}

/// `POST /api/v1/tickets/generate`
pub async fn generate<S: RangeStore + 'static>(
    State(state): State<AppState<S>>,
    RequestId(request_id): RequestId,
    payload: Result<Json<TicketRequest>, JsonRejection>,
) -> Result<Created<TicketData>, ApiError> {
    telemetry::increment_requests();
    let body = parse(payload, &request_id)?;
    body.validate()
        .map_err(|e| ApiError::new(e, &request_id))?;

    tracing::info!(
        service_id = %body.service_id,
        client_id = %body.metadata.client_id,
        "generate ticket"
    );

    let started = Instant::now();
    let inflight = telemetry::InflightClaim::start();
    let result = state.allocator.claim_one().await;
    drop(inflight);
    observe("single", started, &result);

    let ticket = result.map_err(|e| ApiError::new(e, &request_id))?;
    telemetry::record_tickets_issued(1);

    Ok((
        StatusCode::CREATED,
        Json(Issued {
            success: true,
            data: TicketData {
                ticket_id: ticket.value.to_string(),
                database_id: state.database_id,
                range_id: ticket.range_id.to_string(),
                timestamp: chrono::Utc::now().timestamp_millis(),
                request_id,
            },
        }),
    ))
}

/// `POST /api/v1/tickets/generate-batch`
pub async fn generate_batch<S: RangeStore + 'static>(
    State(state): State<AppState<S>>,
    RequestId(request_id): RequestId,
    payload: Result<Json<BatchRequest>, JsonRejection>,
) -> Result<Created<BatchData>, ApiError> {
    telemetry::increment_requests();
    let body = parse(payload, &request_id)?;
    body.ticket
        .validate()
        .map_err(|e| ApiError::new(e, &request_id))?;

    tracing::info!(
        count = body.count,
        service_id = %body.ticket.service_id,
        client_id = %body.ticket.metadata.client_id,
        "generate batch tickets"
    );

    let started = Instant::now();
    let inflight = telemetry::InflightClaim::start();
    let result = state.allocator.claim_batch(body.count).await;
    drop(inflight);
    observe("batch", started, &result);

    let block = result.map_err(|e| ApiError::new(e, &request_id))?;
    telemetry::record_tickets_issued(block.len().unsigned_abs());

    Ok((
        StatusCode::CREATED,
        Json(Issued {
            success: true,
            data: BatchData {
                start_ticket_id: block.start.to_string(),
                end_ticket_id: block.end.to_string(),
                ticket_range: block.len(),
                database_id: state.database_id,
                range_id: block.range_id.to_string(),
                timestamp: chrono::Utc::now().timestamp_millis(),
                request_id,
            },
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(service_id: &str, client_id: &str) -> TicketRequest {
        TicketRequest {
            service_id: service_id.to_owned(),
            metadata: RequestMetadata {
                client_id: client_id.to_owned(),
                request_context: RequestContext {
                    reason: Reason::ShortUrlGeneration,
                },
            },
        }
    }

    #[test]
    fn identifiers_are_length_checked_in_characters() {
        assert!(request("svc", "client").validate().is_ok());
        assert!(request("", "client").validate().is_err());
        assert!(request("svc", "").validate().is_err());
        assert!(request(&"a".repeat(128), "client").validate().is_ok());
        assert!(request(&"a".repeat(129), "client").validate().is_err());
        // 128 multi-byte characters are still within bounds
        assert!(request("svc", &"é".repeat(128)).validate().is_ok());
    }

    #[test]
    fn batch_request_flattens_the_common_fields() {
        let body: BatchRequest = serde_json::from_str(
            r#"{
                "count": 10,
                "service_id": "shortener",
                "metadata": {
                    "client_id": "web-1",
                    "request_context": { "reason": "short_url_generation" }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(body.count, 10);
        assert_eq!(body.ticket.service_id, "shortener");
        assert_eq!(
            body.ticket.metadata.request_context.reason,
            Reason::ShortUrlGeneration
        );
    }

    #[tokio::test]
    async fn abandoned_request_releases_its_inflight_claim() {
        use ticketer::{Allocator, AllocatorConfig, MemoryRangeStore, RangeStore, RangeTxn};

        let store = MemoryRangeStore::default();
        store.provision(0, 10).unwrap();
        let state = AppState::new(Allocator::new(store.clone(), AllocatorConfig::default()), 1);

        // the sole range stays locked, so the handler parks in the claim
        let mut holder = store.begin().await.unwrap();
        holder.select_eligible_range(1).await.unwrap().unwrap();

        let before = telemetry::claims_inflight();
        let handler = generate(
            State(state),
            RequestId("req-1".to_owned()),
            Ok(Json(request("svc", "client"))),
        );
        let abandoned =
            tokio::time::timeout(std::time::Duration::from_millis(50), handler).await;
        assert!(abandoned.is_err());
        assert_eq!(telemetry::claims_inflight(), before);
    }

    #[test]
    fn unknown_reasons_do_not_parse() {
        let parsed = serde_json::from_str::<RequestContext>(r#"{ "reason": "analytics" }"#);
        assert!(parsed.is_err());
    }
}
