use super::{ContentionPolicy, RangeStore, RangeTxn, check_bounds};
use crate::{Error, Range, RangeId, Result};
use chrono::{DateTime, Utc};
use core::time::Duration;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};

/// Schema for the `ranges` table, applied by [`PostgresRangeStore::migrate`].
pub const SCHEMA: &str = include_str!("../../migrations/0001_create_ranges.sql");

const SELECT_SKIP_LOCKED: &str = r#"
SELECT "id", "start", "end", "current", "status", "updated_at"
FROM ranges
WHERE "status" = 'active' AND "end" - ("start" + "current") >= $1
LIMIT 1
FOR UPDATE SKIP LOCKED"#;

// Capped at 2: the caller only needs to tell none, one and several apart.
const COUNT_ELIGIBLE: &str = r#"
SELECT count(*) FROM (
    SELECT 1 FROM ranges
    WHERE "status" = 'active' AND "end" - ("start" + "current") >= $1
    LIMIT 2
) AS eligible"#;

// Postgres re-evaluates the WHERE clause against the newest row version once
// the lock is granted, so a row drained by the previous holder is dropped.
const SELECT_WAIT: &str = r#"
SELECT "id", "start", "end", "current", "status", "updated_at"
FROM ranges
WHERE "status" = 'active' AND "end" - ("start" + "current") >= $1
ORDER BY "id"
LIMIT 1
FOR UPDATE"#;

const ADVANCE: &str = r#"
UPDATE ranges
SET "current" = "current" + $2,
    "status" = CASE WHEN "start" + "current" + $2 >= "end" THEN 'exhausted' ELSE "status" END,
    "updated_at" = now()
WHERE "id" = $1 AND "status" = 'active' AND "start" + "current" + $2 <= "end"
RETURNING "id", "start", "end", "current", "status", "updated_at""#;

const INSERT: &str = r#"
INSERT INTO ranges ("start", "end", "current", "status")
VALUES ($1, $2, $3, CASE WHEN $1 + $3 >= $2 THEN 'exhausted' ELSE 'active' END)
RETURNING "id", "start", "end", "current", "status", "updated_at""#;

const FETCH: &str = r#"
SELECT "id", "start", "end", "current", "status", "updated_at"
FROM ranges
WHERE "id" = $1"#;

/// Connection pool sizing for [`PostgresRangeStore::connect`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub min_connections: u32,
    pub max_connections: u32,
    /// How long a claim may wait for a pooled connection.
    pub acquire_timeout: Duration,
    pub application_name: Option<String>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_connections: 5,
            max_connections: 25,
            acquire_timeout: Duration::from_secs(3),
            application_name: None,
        }
    }
}

fn row_to_range(row: &PgRow) -> Result<Range> {
    let status: String = row.try_get("status").map_err(Error::sqlx("decode row"))?;
    let range = Range {
        id: RangeId(row.try_get("id").map_err(Error::sqlx("decode row"))?),
        start: row.try_get("start").map_err(Error::sqlx("decode row"))?,
        end: row.try_get("end").map_err(Error::sqlx("decode row"))?,
        current: row.try_get("current").map_err(Error::sqlx("decode row"))?,
        status: status.parse().map_err(|e| Error::store("decode row", e))?,
        updated_at: row
            .try_get::<DateTime<Utc>, _>("updated_at")
            .map_err(Error::sqlx("decode row"))?,
    };
    if !range.is_consistent() {
        return Err(Error::corrupt(
            "decode row",
            format!("range {} violates its invariants: {range:?}", range.id),
        ));
    }
    Ok(range)
}

/// A Postgres-backed [`RangeStore`].
///
/// Each transaction owns one pooled connection for its whole lifetime and
/// hands it back when committed, rolled back or dropped.
#[derive(Clone)]
pub struct PostgresRangeStore {
    pool: PgPool,
    policy: ContentionPolicy,
}

impl PostgresRangeStore {
    /// Builds a pool and opens its minimum number of connections.
    pub async fn connect(url: &str, options: &PoolOptions, policy: ContentionPolicy) -> Result<Self> {
        let mut connect_options: sqlx::postgres::PgConnectOptions =
            url.parse().map_err(Error::sqlx("parse connection string"))?;
        if let Some(name) = &options.application_name {
            connect_options = connect_options.application_name(name);
        }
        let pool = PgPoolOptions::new()
            .min_connections(options.min_connections)
            .max_connections(options.max_connections)
            .acquire_timeout(options.acquire_timeout)
            .connect_with(connect_options)
            .await
            .map_err(Error::sqlx("connect"))?;
        Ok(Self::with_pool(pool, policy))
    }

    pub fn with_pool(pool: PgPool, policy: ContentionPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn policy(&self) -> ContentionPolicy {
        self.policy
    }

    /// Creates the `ranges` table and its guard trigger if missing.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(Error::sqlx("migrate"))?;
        Ok(())
    }

    /// Inserts a fresh active range covering `[start, end)`.
    pub async fn provision(&self, start: i64, end: i64) -> Result<Range> {
        self.provision_resumed(start, end, 0).await
    }

    /// Inserts a range whose cursor resumes at `current`.
    pub async fn provision_resumed(&self, start: i64, end: i64, current: i64) -> Result<Range> {
        check_bounds(start, end, current)?;
        let row = sqlx::query(INSERT)
            .bind(start)
            .bind(end)
            .bind(current)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::sqlx("provision"))?;
        row_to_range(&row)
    }

    /// Reads the committed state of one row.
    pub async fn fetch(&self, id: RangeId) -> Result<Option<Range>> {
        sqlx::query(FETCH)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::sqlx("fetch"))?
            .as_ref()
            .map(row_to_range)
            .transpose()
    }

    /// Waits for checked-out connections to return and closes the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl RangeStore for PostgresRangeStore {
    type Txn = PostgresTxn;

    async fn begin(&self) -> Result<PostgresTxn> {
        let tx = self.pool.begin().await.map_err(Error::sqlx("begin"))?;
        Ok(PostgresTxn {
            tx,
            policy: self.policy,
            locked: None,
        })
    }
}

/// Transaction handle for [`PostgresRangeStore`].
///
/// Dropping it without committing rolls the transaction back.
pub struct PostgresTxn {
    tx: Transaction<'static, Postgres>,
    policy: ContentionPolicy,
    locked: Option<RangeId>,
}

impl PostgresTxn {
    async fn select_with(&mut self, sql: &'static str, required: i64) -> Result<Option<Range>> {
        let row = sqlx::query(sql)
            .bind(required)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(Error::sqlx("select"))?;
        let range = row.as_ref().map(row_to_range).transpose()?;
        if let Some(range) = &range {
            self.locked = Some(range.id);
        }
        Ok(range)
    }
}

impl RangeTxn for PostgresTxn {
    async fn select_eligible_range(&mut self, required: i64) -> Result<Option<Range>> {
        if self.locked.is_some() {
            return Err(Error::corrupt(
                "select",
                "transaction already holds a range lock",
            ));
        }

        loop {
            if let Some(range) = self.select_with(SELECT_SKIP_LOCKED, required).await? {
                return Ok(Some(range));
            }
            if self.policy == ContentionPolicy::Skip {
                return Ok(None);
            }

            // Nothing free. Queue for the lock only when exactly one eligible
            // row exists; none is exhaustion and several are all busy.
            let eligible: i64 = sqlx::query_scalar(COUNT_ELIGIBLE)
                .bind(required)
                .fetch_one(&mut *self.tx)
                .await
                .map_err(Error::sqlx("select"))?;
            if eligible != 1 {
                return Ok(None);
            }
            if let Some(range) = self.select_with(SELECT_WAIT, required).await? {
                return Ok(Some(range));
            }
            // the row we queued on was drained by its holder, probe again
        }
    }

    async fn advance_range(&mut self, id: RangeId, delta: i64) -> Result<Range> {
        if self.locked != Some(id) {
            return Err(Error::corrupt(
                "advance",
                format!("range {id} is not the range locked by this transaction"),
            ));
        }
        let row = sqlx::query(ADVANCE)
            .bind(id.get())
            .bind(delta)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(Error::sqlx("advance"))?
            .ok_or_else(|| {
                Error::corrupt(
                    "advance",
                    format!("range {id} has no room for {delta} ticket(s)"),
                )
            })?;
        row_to_range(&row)
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(Error::sqlx("commit"))
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(Error::sqlx("rollback"))
    }
}
