//! Points ledger and balance store.
//!
//! The ledger is append-only. The balance row is a cached sum of it, and it is only
//! ever moved by [`apply_delta`] in the same transaction as the ledger insert.

use crate::error::{LedgerError, Result, ValidationError};
use chrono::{DateTime, Utc};
use common::clock::{parse_db_timestamp, to_db_timestamp, Clock};
use common::db::{AsyncDb, Tables};
use common::types::LedgerReason;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// A ledger row to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointsEntry {
    pub user_id: i64,
    pub delta: i64,
    pub reason: LedgerReason,
    pub ref_comment_id: Option<i64>,
    pub ref_post_id: Option<i64>,
    pub investment_id: Option<i64>,
    pub day_key: Option<String>,
}

impl PointsEntry {
    pub fn new(user_id: i64, delta: i64, reason: LedgerReason) -> Self {
        Self {
            user_id,
            delta,
            reason,
            ref_comment_id: None,
            ref_post_id: None,
            investment_id: None,
            day_key: None,
        }
    }

    pub fn comment(mut self, comment_id: i64) -> Self {
        self.ref_comment_id = Some(comment_id);
        self
    }

    pub fn post(mut self, post_id: i64) -> Self {
        self.ref_post_id = Some(post_id);
        self
    }

    pub fn investment(mut self, investment_id: i64) -> Self {
        self.investment_id = Some(investment_id);
        self
    }

    pub fn day(mut self, day_key: impl Into<String>) -> Self {
        self.day_key = Some(day_key.into());
        self
    }
}

/// Result of appending one ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PointsReceipt {
    pub entry_id: i64,
    pub balance: i64,
}

/// A stored ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: i64,
    pub delta: i64,
    pub reason: LedgerReason,
    pub ref_comment_id: Option<i64>,
    pub ref_post_id: Option<i64>,
    pub investment_id: Option<i64>,
    pub day_key: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub user_id: i64,
    pub balance: i64,
    pub ledger_sum: i64,
}

impl Reconciliation {
    pub fn is_consistent(&self) -> bool {
        self.balance == self.ledger_sum
    }
}

/// Current balance, 0 when the user has no balance row yet.
pub fn read_balance(conn: &Connection, t: &Tables, user_id: i64) -> rusqlite::Result<i64> {
    let balance: Option<i64> = conn
        .query_row(
            &format!("SELECT balance FROM {} WHERE user_id = ?1", t.user_points),
            [user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(balance.unwrap_or(0))
}

pub(crate) fn ensure_balance_row(
    conn: &Connection,
    t: &Tables,
    user_id: i64,
    now: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT OR IGNORE INTO {} (user_id, balance, updated_at) VALUES (?1, 0, ?2)",
            t.user_points
        ),
        rusqlite::params![user_id, now],
    )?;
    Ok(())
}

/// Move a balance and append the matching ledger row.
///
/// Must run inside a transaction; the caller decides whether to commit.
pub(crate) fn apply_delta(
    conn: &Connection,
    t: &Tables,
    entry: &PointsEntry,
    now: DateTime<Utc>,
) -> rusqlite::Result<PointsReceipt> {
    let now = to_db_timestamp(now);
    ensure_balance_row(conn, t, entry.user_id, &now)?;

    let balance: i64 = conn.query_row(
        &format!(
            "UPDATE {} SET balance = balance + ?1, updated_at = ?2
             WHERE user_id = ?3
             RETURNING balance",
            t.user_points
        ),
        rusqlite::params![entry.delta, now, entry.user_id],
        |row| row.get(0),
    )?;

    conn.execute(
        &format!(
            "INSERT INTO {} (user_id, delta, reason, ref_comment_id, ref_post_id,
                             investment_id, day_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            t.points_ledger
        ),
        rusqlite::params![
            entry.user_id,
            entry.delta,
            entry.reason,
            entry.ref_comment_id,
            entry.ref_post_id,
            entry.investment_id,
            entry.day_key,
            now,
        ],
    )?;

    Ok(PointsReceipt {
        entry_id: conn.last_insert_rowid(),
        balance,
    })
}

fn ledger_sum(conn: &Connection, t: &Tables, user_id: i64) -> rusqlite::Result<i64> {
    conn.query_row(
        &format!(
            "SELECT COALESCE(SUM(delta), 0) FROM {} WHERE user_id = ?1",
            t.points_ledger
        ),
        [user_id],
        |row| row.get(0),
    )
}

fn query_history(
    conn: &Connection,
    t: &Tables,
    user_id: i64,
    limit: u32,
) -> rusqlite::Result<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, user_id, delta, reason, ref_comment_id, ref_post_id, investment_id,
                day_key, created_at
         FROM {}
         WHERE user_id = ?1
         ORDER BY id DESC
         LIMIT ?2",
        t.points_ledger
    ))?;
    let rows = stmt.query_map(rusqlite::params![user_id, limit], |row| {
        let created_at: String = row.get(8)?;
        Ok(LedgerEntry {
            id: row.get(0)?,
            user_id: row.get(1)?,
            delta: row.get(2)?,
            reason: row.get(3)?,
            ref_comment_id: row.get(4)?,
            ref_post_id: row.get(5)?,
            investment_id: row.get(6)?,
            day_key: row.get(7)?,
            created_at: parse_db_timestamp(&created_at),
        })
    })?;
    rows.collect()
}

/// Async facade over the ledger tables.
#[derive(Clone)]
pub struct PointsLedger {
    db: AsyncDb,
    clock: Arc<dyn Clock>,
}

impl PointsLedger {
    pub fn new(db: AsyncDb, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Append a ledger row and move the balance, atomically.
    pub async fn add_points(&self, entry: PointsEntry) -> Result<PointsReceipt> {
        if entry.delta == 0 {
            return Err(ValidationError::ZeroDelta.into());
        }
        let now = self.clock.now();
        let reason = entry.reason;
        let user_id = entry.user_id;
        let delta = entry.delta;

        let receipt = self
            .db
            .transaction("points.add", move |tx, t| -> Result<PointsReceipt> {
                Ok(apply_delta(tx, t, &entry, now)?)
            })
            .await?;

        if delta > 0 {
            metrics::counter!("hub_points_awarded_total", "reason" => reason.as_str())
                .increment(delta.unsigned_abs());
        }
        info!(
            user_id,
            delta,
            reason = reason.as_str(),
            balance = receipt.balance,
            "points applied"
        );
        Ok(receipt)
    }

    pub async fn get_balance(&self, user_id: i64) -> Result<i64> {
        self.db
            .call_named("points.balance", move |conn, t| {
                Ok(read_balance(conn, t, user_id)?)
            })
            .await
            .map_err(LedgerError::from)
    }

    /// Newest entries first.
    pub async fn history(&self, user_id: i64, limit: u32) -> Result<Vec<LedgerEntry>> {
        self.db
            .call_named("points.history", move |conn, t| {
                Ok(query_history(conn, t, user_id, limit)?)
            })
            .await
            .map_err(LedgerError::from)
    }

    /// Compare the cached balance with the ledger sum, read in one transaction.
    pub async fn reconcile(&self, user_id: i64) -> Result<Reconciliation> {
        self.db
            .transaction("points.reconcile", move |tx, t| -> Result<Reconciliation> {
                Ok(Reconciliation {
                    user_id,
                    balance: read_balance(tx, t, user_id)?,
                    ledger_sum: ledger_sum(tx, t, user_id)?,
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::clock::FixedClock;

    async fn setup() -> (AsyncDb, PointsLedger) {
        let db = AsyncDb::open_memory().await.unwrap();
        db.call(|conn, t| {
            conn.execute(
                &format!("INSERT INTO {} (id, email) VALUES (1, 'a@x.io'), (2, 'b@x.io')", t.users),
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).unwrap(),
        ));
        let ledger = PointsLedger::new(db.clone(), clock);
        (db, ledger)
    }

    #[tokio::test]
    async fn test_balance_defaults_to_zero() {
        let (_db, ledger) = setup().await;
        assert_eq!(ledger.get_balance(1).await.unwrap(), 0);
        assert_eq!(ledger.get_balance(999).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_add_points_creates_balance_and_ledger_row() {
        let (_db, ledger) = setup().await;
        let receipt = ledger
            .add_points(PointsEntry::new(1, 40, LedgerReason::Adjustment))
            .await
            .unwrap();
        assert_eq!(receipt.balance, 40);

        let receipt = ledger
            .add_points(PointsEntry::new(1, -15, LedgerReason::Adjustment))
            .await
            .unwrap();
        assert_eq!(receipt.balance, 25);
        assert_eq!(ledger.get_balance(1).await.unwrap(), 25);

        let history = ledger.history(1, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].delta, -15);
        assert_eq!(history[1].delta, 40);
        assert_eq!(
            history[0].created_at,
            Some(Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).unwrap())
        );

        let rec = ledger.reconcile(1).await.unwrap();
        assert!(rec.is_consistent());
        assert_eq!(rec.ledger_sum, 25);
    }

    #[tokio::test]
    async fn test_zero_delta_rejected() {
        let (_db, ledger) = setup().await;
        let err = ledger
            .add_points(PointsEntry::new(1, 0, LedgerReason::Adjustment))
            .await
            .unwrap_err();
        assert_eq!(err.validation(), Some(&ValidationError::ZeroDelta));
        assert!(ledger.history(1, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_ledger_insert_leaves_balance_untouched() {
        let (_db, ledger) = setup().await;
        ledger
            .add_points(PointsEntry::new(1, 10, LedgerReason::Adjustment))
            .await
            .unwrap();

        // Dangling comment reference violates the ledger's foreign key after the balance moved.
        let err = ledger
            .add_points(PointsEntry::new(1, 5, LedgerReason::Adjustment).comment(4242))
            .await;
        assert!(err.is_err());
        assert!(!err.unwrap_err().is_caller_error());

        assert_eq!(ledger.get_balance(1).await.unwrap(), 10);
        assert!(ledger.reconcile(1).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_unknown_user_is_storage_error() {
        let (_db, ledger) = setup().await;
        let err = ledger
            .add_points(PointsEntry::new(77, 5, LedgerReason::Adjustment))
            .await
            .unwrap_err();
        assert!(!err.is_caller_error());
        assert_eq!(ledger.get_balance(77).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_history_limit_and_isolation() {
        let (_db, ledger) = setup().await;
        for delta in [1, 2, 3] {
            ledger
                .add_points(PointsEntry::new(1, delta, LedgerReason::Adjustment))
                .await
                .unwrap();
        }
        ledger
            .add_points(PointsEntry::new(2, 9, LedgerReason::Adjustment).day("2026-02-01"))
            .await
            .unwrap();

        let history = ledger.history(1, 2).await.unwrap();
        assert_eq!(
            history.iter().map(|e| e.delta).collect::<Vec<_>>(),
            vec![3, 2]
        );
        let other = ledger.history(2, 10).await.unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].day_key.as_deref(), Some("2026-02-01"));
    }
}
