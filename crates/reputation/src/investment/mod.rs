//! Comment investments: escrowed stakes that pay out when the staked comment
//! leads its thread on both score and views at settlement time.
//!
//! Every operation here is one `BEGIN IMMEDIATE` unit of work. The balance check and
//! the stake deduction share a transaction, so two concurrent invests by the same
//! user cannot both pass the check.

mod settlement;

pub use settlement::SettlementSummary;

use crate::error::{LedgerError, Result, ValidationError};
use crate::hub::{load_post, optional_timestamp_column, timestamp_column};
use crate::points::{apply_delta, read_balance, PointsEntry};
use chrono::{DateTime, Duration, Utc};
use common::clock::{to_db_timestamp, Clock};
use common::config::Investment;
use common::db::{AsyncDb, Tables};
use common::types::{InvestmentStatus, LedgerReason};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Result of a successful `invest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvestmentSummary {
    pub investment_id: i64,
    pub investor_user_id: i64,
    pub comment_id: i64,
    pub post_id: i64,
    pub amount: i64,
    pub status: InvestmentStatus,
    pub settle_at: DateTime<Utc>,
    pub balance_after: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvestmentRecord {
    pub id: i64,
    pub investor_user_id: i64,
    pub comment_id: i64,
    pub post_id: i64,
    pub amount: i64,
    pub status: InvestmentStatus,
    pub settle_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub payout_amount: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Outcome counts for one `settle_due` sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SettleDueReport {
    pub due: usize,
    pub won: usize,
    pub lost: usize,
    pub skipped: usize,
    pub failed: usize,
}

const INVESTMENT_COLUMNS: &str = "id, investor_user_id, comment_id, post_id, amount, status, \
     settle_at, settled_at, payout_amount, created_at";

fn investment_from_row(row: &Row<'_>) -> rusqlite::Result<InvestmentRecord> {
    Ok(InvestmentRecord {
        id: row.get(0)?,
        investor_user_id: row.get(1)?,
        comment_id: row.get(2)?,
        post_id: row.get(3)?,
        amount: row.get(4)?,
        status: row.get(5)?,
        settle_at: timestamp_column(row, 6)?,
        settled_at: optional_timestamp_column(row, 7)?,
        payout_amount: row.get(8)?,
        created_at: timestamp_column(row, 9)?,
    })
}

pub(crate) fn load_investment(
    conn: &Connection,
    t: &Tables,
    investment_id: i64,
) -> rusqlite::Result<Option<InvestmentRecord>> {
    conn.query_row(
        &format!("SELECT {INVESTMENT_COLUMNS} FROM {} WHERE id = ?1", t.investments),
        [investment_id],
        investment_from_row,
    )
    .optional()
}

fn invest_sync(
    conn: &Connection,
    t: &Tables,
    settings: &Investment,
    investor_id: i64,
    comment_id: i64,
    amount: i64,
    now: DateTime<Utc>,
) -> Result<InvestmentSummary> {
    if amount < settings.min_points {
        return Err(ValidationError::BelowMinimum {
            amount,
            min: settings.min_points,
        }
        .into());
    }
    // The largest stake whose payout still fits in an i64.
    let max = i64::MAX
        .checked_div(settings.payout_multiplier)
        .unwrap_or(i64::MAX);
    if amount > max {
        return Err(ValidationError::AboveMaximum { amount, max }.into());
    }
    let comment =
        load_post(conn, t, comment_id)?.ok_or(ValidationError::CommentNotFound(comment_id))?;
    let post_id = comment
        .parent_id
        .ok_or(ValidationError::NotAComment(comment_id))?;
    if comment.user_id == investor_id {
        return Err(ValidationError::SelfInvestment {
            user_id: investor_id,
            comment_id,
        }
        .into());
    }
    if comment.moderation_status.is_moderated_away() {
        return Err(ValidationError::CommentIneligible {
            comment_id,
            status: comment.moderation_status,
        }
        .into());
    }
    let available = read_balance(conn, t, investor_id)?;
    if available < amount {
        return Err(ValidationError::InsufficientBalance {
            available,
            requested: amount,
        }
        .into());
    }

    let settle_at = now + Duration::days(settings.window_days);
    conn.execute(
        &format!(
            "INSERT INTO {}
                (investor_user_id, comment_id, post_id, amount, status, settle_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            t.investments
        ),
        rusqlite::params![
            investor_id,
            comment_id,
            post_id,
            amount,
            InvestmentStatus::Pending,
            to_db_timestamp(settle_at),
            to_db_timestamp(now),
        ],
    )?;
    let investment_id = conn.last_insert_rowid();

    let stake = PointsEntry::new(investor_id, -amount, LedgerReason::InvestStake)
        .comment(comment_id)
        .post(post_id)
        .investment(investment_id);
    let receipt = apply_delta(conn, t, &stake, now)?;

    Ok(InvestmentSummary {
        investment_id,
        investor_user_id: investor_id,
        comment_id,
        post_id,
        amount,
        status: InvestmentStatus::Pending,
        settle_at,
        balance_after: receipt.balance,
    })
}

fn result_label(res: &Result<InvestmentSummary>) -> &'static str {
    match res {
        Ok(_) => "accepted",
        Err(e) if e.is_caller_error() => "rejected",
        Err(_) => "error",
    }
}

#[derive(Clone)]
pub struct InvestmentEngine {
    db: AsyncDb,
    clock: Arc<dyn Clock>,
    settings: Investment,
}

impl InvestmentEngine {
    pub fn new(db: AsyncDb, clock: Arc<dyn Clock>, settings: Investment) -> Self {
        Self { db, clock, settings }
    }

    pub fn settings(&self) -> &Investment {
        &self.settings
    }

    /// Stake `amount` points of `investor_id` on `comment_id`.
    ///
    /// Checks run in a fixed order and the first failure is returned. A rejected
    /// call writes nothing.
    pub async fn invest(
        &self,
        investor_id: i64,
        comment_id: i64,
        amount: i64,
    ) -> Result<InvestmentSummary> {
        let settings = self.settings;
        let now = self.clock.now();
        let res = self
            .db
            .transaction("investment.invest", move |tx, t| {
                invest_sync(tx, t, &settings, investor_id, comment_id, amount, now)
            })
            .await;

        metrics::counter!("hub_investments_total", "result" => result_label(&res)).increment(1);
        match &res {
            Ok(summary) => info!(
                investment_id = summary.investment_id,
                investor_id,
                comment_id,
                amount,
                balance_after = summary.balance_after,
                "investment placed"
            ),
            Err(err) if err.is_caller_error() => {
                info!(investor_id, comment_id, amount, reason = %err, "investment rejected")
            }
            Err(err) => warn!(investor_id, comment_id, amount, error = %err, "investment failed"),
        }
        res
    }

    /// Settle one investment now, regardless of `settle_at`.
    pub async fn settle(&self, investment_id: i64) -> Result<SettlementSummary> {
        let multiplier = self.settings.payout_multiplier;
        let now = self.clock.now();
        let summary = self
            .db
            .transaction("investment.settle", move |tx, t| {
                settlement::settle_sync(tx, t, investment_id, multiplier, now)
            })
            .await?;

        if summary.already_settled {
            info!(
                investment_id,
                status = summary.status.as_str(),
                "investment already settled"
            );
        } else {
            metrics::counter!("hub_settlements_total", "status" => summary.status.as_str())
                .increment(1);
            info!(
                investment_id,
                status = summary.status.as_str(),
                payout = summary.payout_amount,
                top_by_score = ?summary.top_by_score,
                top_by_views = ?summary.top_by_views,
                "investment settled"
            );
        }
        Ok(summary)
    }

    /// Settle pending investments whose window has closed, oldest first.
    ///
    /// Each investment is its own transaction. A failure is logged and counted and the
    /// sweep moves on.
    pub async fn settle_due(&self, limit: u32) -> Result<SettleDueReport> {
        let now = to_db_timestamp(self.clock.now());
        let started = Instant::now();
        let due: Vec<i64> = self
            .db
            .call_named("investment.due", move |conn, t| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT id FROM {}
                     WHERE status = ?1 AND settle_at <= ?2
                     ORDER BY settle_at ASC, id ASC
                     LIMIT ?3",
                    t.investments
                ))?;
                let params = rusqlite::params![InvestmentStatus::Pending, now, limit];
                let ids = stmt
                    .query_map(params, |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<i64>>>()?;
                Ok(ids)
            })
            .await?;

        let mut report = SettleDueReport {
            due: due.len(),
            ..SettleDueReport::default()
        };
        for investment_id in due {
            match self.settle(investment_id).await {
                Ok(s) if s.already_settled => report.skipped += 1,
                Ok(s) if s.status == InvestmentStatus::Won => report.won += 1,
                Ok(_) => report.lost += 1,
                Err(err) => {
                    report.failed += 1;
                    metrics::counter!("hub_settlements_total", "status" => "error").increment(1);
                    warn!(investment_id, error = %err, "settlement failed");
                }
            }
        }

        if report.due > 0 {
            info!(
                due = report.due,
                won = report.won,
                lost = report.lost,
                failed = report.failed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "settlement sweep finished"
            );
        }
        Ok(report)
    }

    pub async fn get(&self, investment_id: i64) -> Result<InvestmentRecord> {
        let found = self
            .db
            .call_named("investment.get", move |conn, t| {
                Ok(load_investment(conn, t, investment_id)?)
            })
            .await?;
        found.ok_or(LedgerError::NotFound(investment_id))
    }

    /// Newest first.
    pub async fn list_for_investor(&self, user_id: i64) -> Result<Vec<InvestmentRecord>> {
        let rows = self
            .db
            .call_named("investment.list_for_investor", move |conn, t| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {INVESTMENT_COLUMNS} FROM {}
                     WHERE investor_user_id = ?1 ORDER BY id DESC",
                    t.investments
                ))?;
                let rows = stmt
                    .query_map([user_id], investment_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }
}
