//! Daily comment streak awards.

use crate::error::Result;
use crate::points::{apply_delta, PointsEntry};
use chrono::{DateTime, Days, NaiveDate, Utc};
use common::clock::day_key;
use common::config::Streak;
use common::db::{AsyncDb, Tables};
use common::types::LedgerReason;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreakAward {
    pub user_id: i64,
    pub day_key: String,
    pub streak_len: u32,
    pub points: i64,
    pub balance: i64,
}

/// Points for day `streak_len` of a streak.
pub fn streak_points(settings: &Streak, streak_len: u32) -> i64 {
    let bonus = if settings.bonus_every_days > 0 && streak_len % settings.bonus_every_days == 0 {
        settings.bonus_points
    } else {
        0
    };
    settings.daily_points + bonus
}

fn has_streak_entry(
    conn: &Connection,
    t: &Tables,
    user_id: i64,
    day: &str,
) -> rusqlite::Result<bool> {
    conn.query_row(
        &format!(
            "SELECT 1 FROM {} WHERE user_id = ?1 AND reason = ?2 AND day_key = ?3 LIMIT 1",
            t.points_ledger
        ),
        rusqlite::params![user_id, LedgerReason::CommentStreak, day],
        |_| Ok(()),
    )
    .optional()
    .map(|hit| hit.is_some())
}

/// Consecutive days before `today` that already carry a streak award.
fn prior_streak_days(
    conn: &Connection,
    t: &Tables,
    user_id: i64,
    today: NaiveDate,
) -> rusqlite::Result<u32> {
    let mut days = 0u32;
    let mut cursor = today;
    while let Some(prev) = cursor.checked_sub_days(Days::new(1)) {
        if !has_streak_entry(conn, t, user_id, &prev.format("%Y-%m-%d").to_string())? {
            break;
        }
        days += 1;
        cursor = prev;
    }
    Ok(days)
}

/// Award today's streak points for a comment, at most once per user per UTC day.
///
/// Returns `None` when the user was already awarded for that day.
pub(crate) fn award_sync(
    conn: &Connection,
    t: &Tables,
    settings: &Streak,
    user_id: i64,
    comment_id: i64,
    posted_at: DateTime<Utc>,
) -> rusqlite::Result<Option<StreakAward>> {
    let day = day_key(posted_at);
    if has_streak_entry(conn, t, user_id, &day)? {
        return Ok(None);
    }

    let streak_len = prior_streak_days(conn, t, user_id, posted_at.date_naive())? + 1;
    let points = streak_points(settings, streak_len);
    let entry = PointsEntry::new(user_id, points, LedgerReason::CommentStreak)
        .comment(comment_id)
        .day(day.clone());
    let receipt = apply_delta(conn, t, &entry, posted_at)?;

    Ok(Some(StreakAward {
        user_id,
        day_key: day,
        streak_len,
        points,
        balance: receipt.balance,
    }))
}

#[derive(Clone)]
pub struct StreakAwarder {
    db: AsyncDb,
    settings: Streak,
}

impl StreakAwarder {
    pub fn new(db: AsyncDb, settings: Streak) -> Self {
        Self { db, settings }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled && self.settings.daily_points > 0
    }

    pub async fn award(
        &self,
        user_id: i64,
        comment_id: i64,
        posted_at: DateTime<Utc>,
    ) -> Result<Option<StreakAward>> {
        if !self.enabled() {
            return Ok(None);
        }
        let settings = self.settings;
        let award = self
            .db
            .transaction("streak.award", move |tx, t| -> Result<Option<StreakAward>> {
                Ok(award_sync(tx, t, &settings, user_id, comment_id, posted_at)?)
            })
            .await?;

        if let Some(award) = &award {
            let reason = LedgerReason::CommentStreak.as_str();
            metrics::counter!("hub_points_awarded_total", "reason" => reason)
                .increment(award.points.unsigned_abs());
            tracing::info!(
                user_id,
                comment_id,
                day_key = %award.day_key,
                streak_len = award.streak_len,
                points = award.points,
                "streak points awarded"
            );
        }
        Ok(award)
    }
}
