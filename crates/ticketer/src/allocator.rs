//! # Allocation Engine
//!
//! [`Allocator`] wraps the claim algorithms with transaction lifecycle
//! management:
//!
//! 1. validate the request (before any connection is touched),
//! 2. acquire a connection and `BEGIN`,
//! 3. run the claim under the configured timeout,
//! 4. `COMMIT` on success, explicit `ROLLBACK` on failure.
//!
//! The transaction value owns its connection, so every exit path (success,
//! exhaustion, error, timeout, or cancellation of the caller's future)
//! returns the connection to the pool exactly once. A timed-out claim is
//! dropped mid-flight, which rolls it back.
//!
//! The allocator has no retry policy. [`Error::PoolExhausted`] is a
//! backpressure signal: capacity is only ever consumed, so retrying without
//! provisioning new ranges cannot succeed.

use crate::claim::{self, Ticket, TicketBatch};
use crate::{Error, ErrorKind, RangeId, RangeStore, RangeTxn, Result};
use core::future::Future;
use core::time::Duration;
use std::time::Instant;
use tokio::time::timeout;

/// Inclusive bounds on the size of a batch claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchBounds {
    pub min: i64,
    pub max: i64,
}

impl BatchBounds {
    pub fn new(min: i64, max: i64) -> Result<Self> {
        if min < 1 || max < min {
            return Err(Error::invalid(format!(
                "batch bounds must satisfy 1 <= min <= max, got [{min}, {max}]"
            )));
        }
        Ok(Self { min, max })
    }

    pub fn check(&self, count: i64) -> Result<()> {
        if count < self.min || count > self.max {
            return Err(Error::invalid(format!(
                "count {count} is outside the allowed range [{}, {}]",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

impl Default for BatchBounds {
    fn default() -> Self {
        Self { min: 1, max: 1_000 }
    }
}

/// Runtime settings for an [`Allocator`].
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    pub batch: BatchBounds,
    /// Upper bound on one claim, from connection acquisition to commit.
    pub claim_timeout: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            batch: BatchBounds::default(),
            claim_timeout: Duration::from_secs(3),
        }
    }
}

/// Issues tickets from the ranges held in a [`RangeStore`].
///
/// Holds no allocation state of its own; concurrent claims coordinate only
/// through the store's row locks. Cloning is as cheap as cloning the store.
#[derive(Clone)]
pub struct Allocator<S> {
    store: S,
    config: AllocatorConfig,
}

impl<S: RangeStore> Allocator<S> {
    pub fn new(store: S, config: AllocatorConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Claims a single ticket.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolExhausted`] if no active range has capacity.
    /// - [`Error::Timeout`] or [`Error::Store`] if the transaction failed; no
    ///   cursor was moved.
    #[tracing::instrument(name = "claim", level = "debug", skip_all, fields(op = "single"))]
    pub async fn claim_one(&self) -> Result<Ticket> {
        let started = Instant::now();
        let result = self
            .run(1, |txn| Box::pin(claim::claim_one(txn)))
            .await;
        report("single", 1, result.as_ref().map(|t| t.range_id), started);
        result
    }

    /// Claims a contiguous block of `count` tickets.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] if `count` is outside the configured
    ///   [`BatchBounds`]; no transaction is opened.
    /// - [`Error::PoolExhausted`] if no single active range can hold the
    ///   whole block.
    /// - [`Error::Timeout`] or [`Error::Store`] if the transaction failed.
    #[tracing::instrument(name = "claim", level = "debug", skip(self), fields(op = "batch"))]
    pub async fn claim_batch(&self, count: i64) -> Result<TicketBatch> {
        let started = Instant::now();
        let result = match self.config.batch.check(count) {
            Ok(()) => {
                self.run(count, |txn| Box::pin(claim::claim_batch(txn, count)))
                    .await
            }
            Err(e) => Err(e),
        };
        report("batch", count, result.as_ref().map(|b| b.range_id), started);
        result
    }

    /// Runs one claim inside its own transaction.
    async fn run<T, F>(&self, requested: i64, claim: F) -> Result<T>
    where
        F: for<'t> FnOnce(
            &'t mut S::Txn,
        ) -> core::pin::Pin<Box<dyn Future<Output = Result<Option<T>>> + Send + 't>>,
    {
        let limit = self.config.claim_timeout;
        let attempt = async {
            let mut txn = self.store.begin().await?;
            match claim(&mut txn).await {
                Ok(outcome) => {
                    // an empty result still commits the no-op transaction
                    txn.commit().await?;
                    outcome.ok_or(Error::PoolExhausted { requested })
                }
                Err(e) => {
                    if let Err(rollback) = txn.rollback().await {
                        tracing::warn!(error = %rollback, "rollback after failed claim also failed");
                    }
                    Err(e)
                }
            }
        };

        match timeout(limit, attempt).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout { after: limit }),
        }
    }
}

fn report(op: &'static str, count: i64, outcome: Result<RangeId, &Error>, started: Instant) {
    let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;
    let e = match outcome {
        Ok(range_id) => {
            tracing::debug!(
                op,
                count,
                outcome = "issued",
                range_id = range_id.get(),
                latency_ms,
                "claim committed"
            );
            return;
        }
        Err(e) => e,
    };
    let kind = e.kind().as_str();
    match e.kind() {
        ErrorKind::PoolExhausted => {
            tracing::warn!(op, count, outcome = kind, latency_ms, "no range has capacity")
        }
        ErrorKind::InvalidRequest => {
            tracing::debug!(op, count, outcome = kind, latency_ms, error = %e, "claim rejected")
        }
        ErrorKind::TransactionFailure => tracing::error!(
            op,
            count,
            outcome = kind,
            latency_ms,
            error = %e,
            "claim failed and was rolled back"
        ),
    }
}
