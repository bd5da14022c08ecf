//! Settling a single investment inside an open transaction.

use super::{load_investment, InvestmentRecord};
use crate::error::{LedgerError, Result};
use crate::hub::{load_post, timestamp_column};
use crate::points::{apply_delta, PointsEntry};
use crate::ranker::{rank_siblings, SiblingStats, Standings};
use chrono::{DateTime, Utc};
use common::clock::to_db_timestamp;
use common::db::Tables;
use common::types::{InvestmentStatus, LedgerReason, ModerationStatus};
use rusqlite::Connection;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettlementSummary {
    pub investment_id: i64,
    pub status: InvestmentStatus,
    pub payout_amount: i64,
    pub settled_at: Option<DateTime<Utc>>,
    /// True when the investment was already terminal and nothing changed.
    pub already_settled: bool,
    pub top_by_score: Option<i64>,
    pub top_by_views: Option<i64>,
}

impl SettlementSummary {
    fn unchanged(inv: &InvestmentRecord) -> Self {
        Self {
            investment_id: inv.id,
            status: inv.status,
            payout_amount: inv.payout_amount.unwrap_or(0),
            settled_at: inv.settled_at,
            already_settled: true,
            top_by_score: None,
            top_by_views: None,
        }
    }
}

/// Visible replies under `post_id` with their net score.
pub(crate) fn sibling_stats(
    conn: &Connection,
    t: &Tables,
    post_id: i64,
) -> rusqlite::Result<Vec<SiblingStats>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT p.id,
                COALESCE(SUM(CASE v.vote_type WHEN 'up' THEN 1 WHEN 'down' THEN -1 END), 0)
                    AS score,
                p.views,
                p.created_at
         FROM {posts} p
         LEFT JOIN {votes} v ON v.post_id = p.id
         WHERE p.parent_id = ?1
           AND p.moderation_status NOT IN (?2, ?3)
         GROUP BY p.id",
        posts = t.posts,
        votes = t.post_votes,
    ))?;
    let rows = stmt.query_map(
        rusqlite::params![post_id, ModerationStatus::Flagged, ModerationStatus::Removed],
        |row| {
            Ok(SiblingStats {
                id: row.get(0)?,
                score: row.get(1)?,
                views: row.get(2)?,
                created_at: timestamp_column(row, 3)?,
            })
        },
    )?;
    rows.collect()
}

/// Resolve a pending investment to won or lost. Terminal investments are returned untouched.
pub(crate) fn settle_sync(
    conn: &Connection,
    t: &Tables,
    investment_id: i64,
    payout_multiplier: i64,
    now: DateTime<Utc>,
) -> Result<SettlementSummary> {
    let inv =
        load_investment(conn, t, investment_id)?.ok_or(LedgerError::NotFound(investment_id))?;
    if inv.status != InvestmentStatus::Pending {
        return Ok(SettlementSummary::unchanged(&inv));
    }

    let comment_visible = load_post(conn, t, inv.comment_id)?
        .is_some_and(|c| !c.moderation_status.is_moderated_away());
    let standings = if comment_visible {
        rank_siblings(&sibling_stats(conn, t, inv.post_id)?)
    } else {
        Standings::default()
    };

    let (status, payout) = if standings.is_double_top(inv.comment_id) {
        let payout = inv.amount.checked_mul(payout_multiplier).ok_or_else(|| {
            anyhow::anyhow!(
                "payout for investment {} overflows: {} x {payout_multiplier}",
                inv.id,
                inv.amount
            )
        })?;
        let entry = PointsEntry::new(inv.investor_user_id, payout, LedgerReason::InvestPayout)
            .comment(inv.comment_id)
            .post(inv.post_id)
            .investment(inv.id);
        apply_delta(conn, t, &entry, now)?;
        (InvestmentStatus::Won, payout)
    } else {
        (InvestmentStatus::Lost, 0)
    };

    let updated = conn.execute(
        &format!(
            "UPDATE {} SET status = ?1, settled_at = ?2, payout_amount = ?3
             WHERE id = ?4 AND status = ?5",
            t.investments
        ),
        rusqlite::params![
            status,
            to_db_timestamp(now),
            payout,
            inv.id,
            InvestmentStatus::Pending
        ],
    )?;
    if updated != 1 {
        return Err(anyhow::anyhow!("investment {} changed during settlement", inv.id).into());
    }

    Ok(SettlementSummary {
        investment_id: inv.id,
        status,
        payout_amount: payout,
        settled_at: Some(now),
        already_settled: false,
        top_by_score: standings.top_by_score,
        top_by_views: standings.top_by_views,
    })
}
