//! Hubs, posts, votes, views and moderation state.
//!
//! The investment engine only reads these tables. This store is how they get written.

use crate::error::{LedgerError, Result, ValidationError};
use crate::event_bus::EventBus;
use crate::events::HubEvent;
use crate::ranker::{rank_siblings, SiblingStats, Standings};
use chrono::{DateTime, Utc};
use common::clock::{parse_db_timestamp, to_db_timestamp, Clock};
use common::db::{AsyncDb, Tables};
use common::types::{ModerationStatus, VoteType};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Post columns the engine needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PostRow {
    pub id: i64,
    pub hub_id: i64,
    pub user_id: i64,
    pub parent_id: Option<i64>,
    pub moderation_status: ModerationStatus,
    pub views: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPost {
    pub hub_id: i64,
    pub user_id: i64,
    pub parent_id: Option<i64>,
    pub title: Option<String>,
    pub content: String,
    pub post_type: String,
}

impl NewPost {
    pub fn thread(hub_id: i64, user_id: i64, title: &str, content: &str) -> Self {
        Self {
            hub_id,
            user_id,
            parent_id: None,
            title: Some(title.to_string()),
            content: content.to_string(),
            post_type: "thread".to_string(),
        }
    }

    pub fn reply(hub_id: i64, user_id: i64, parent_id: i64, content: &str) -> Self {
        Self {
            hub_id,
            user_id,
            parent_id: Some(parent_id),
            title: None,
            content: content.to_string(),
            post_type: "reply".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommentStats {
    pub id: i64,
    pub user_id: i64,
    pub parent_id: Option<i64>,
    pub score: i64,
    pub views: i64,
    pub moderation_status: ModerationStatus,
    pub created_at: DateTime<Utc>,
}

/// A top-level post or a comment, with its author and counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostDetail {
    pub id: i64,
    pub title: Option<String>,
    pub content: String,
    pub post_type: String,
    pub author: String,
    pub score: i64,
    pub views: i64,
    pub moderation_status: ModerationStatus,
    pub comment_count: i64,
    pub created_at: DateTime<Utc>,
}

/// A post with its comments, oldest first, and the current leaders among the visible ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Thread {
    pub post: PostDetail,
    pub comments: Vec<PostDetail>,
    pub standings: Standings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HubSummary {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
}

fn invalid_timestamp(idx: usize, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("invalid timestamp {raw:?}").into(),
    )
}

pub(crate) fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_timestamp(&raw).ok_or_else(|| invalid_timestamp(idx, &raw))
}

/// Like [`timestamp_column`], for nullable columns. NULL is `None`, bad text is an error.
pub(crate) fn optional_timestamp_column(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| parse_db_timestamp(&raw).ok_or_else(|| invalid_timestamp(idx, &raw)))
        .transpose()
}

pub(crate) fn load_post(
    conn: &Connection,
    t: &Tables,
    post_id: i64,
) -> rusqlite::Result<Option<PostRow>> {
    conn.query_row(
        &format!(
            "SELECT id, hub_id, user_id, parent_id, moderation_status, views, created_at
             FROM {} WHERE id = ?1",
            t.posts
        ),
        [post_id],
        |row| {
            Ok(PostRow {
                id: row.get(0)?,
                hub_id: row.get(1)?,
                user_id: row.get(2)?,
                parent_id: row.get(3)?,
                moderation_status: row.get(4)?,
                views: row.get(5)?,
                created_at: timestamp_column(row, 6)?,
            })
        },
    )
    .optional()
}

fn post_detail_query(t: &Tables, filter: &str) -> String {
    format!(
        "SELECT p.id, p.title, p.content, p.post_type, u.email,
                (SELECT COALESCE(SUM(CASE v.vote_type WHEN 'up' THEN 1 WHEN 'down' THEN -1 END), 0)
                 FROM {votes} v WHERE v.post_id = p.id) AS score,
                p.views, p.moderation_status,
                (SELECT COUNT(*) FROM {posts} c WHERE c.parent_id = p.id) AS comment_count,
                p.created_at
         FROM {posts} p
         JOIN {users} u ON u.id = p.user_id
         {filter}",
        posts = t.posts,
        votes = t.post_votes,
        users = t.users,
    )
}

fn post_detail_from_row(row: &Row<'_>) -> rusqlite::Result<PostDetail> {
    Ok(PostDetail {
        id: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        post_type: row.get(3)?,
        author: row.get(4)?,
        score: row.get(5)?,
        views: row.get(6)?,
        moderation_status: row.get(7)?,
        comment_count: row.get(8)?,
        created_at: timestamp_column(row, 9)?,
    })
}

/// Net vote score: ups minus downs.
pub(crate) fn post_score(conn: &Connection, t: &Tables, post_id: i64) -> rusqlite::Result<i64> {
    conn.query_row(
        &format!(
            "SELECT COALESCE(SUM(CASE vote_type WHEN 'up' THEN 1 WHEN 'down' THEN -1 ELSE 0 END), 0)
             FROM {} WHERE post_id = ?1",
            t.post_votes
        ),
        [post_id],
        |row| row.get(0),
    )
}

#[derive(Clone)]
pub struct HubStore {
    db: AsyncDb,
    clock: Arc<dyn Clock>,
    bus: EventBus,
}

impl HubStore {
    pub fn new(db: AsyncDb, clock: Arc<dyn Clock>, bus: EventBus) -> Self {
        Self { db, clock, bus }
    }

    pub async fn create_user(&self, email: &str) -> Result<i64> {
        let email = email.to_string();
        let now = to_db_timestamp(self.clock.now());
        let id = self
            .db
            .call_named("hub.create_user", move |conn, t| {
                conn.execute(
                    &format!("INSERT INTO {} (email, created_at) VALUES (?1, ?2)", t.users),
                    rusqlite::params![email, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    pub async fn create_hub(
        &self,
        org_id: i64,
        name: &str,
        description: Option<&str>,
    ) -> Result<i64> {
        let name = name.to_string();
        let description = description.map(str::to_string);
        let now = to_db_timestamp(self.clock.now());
        let id = self
            .db
            .call_named("hub.create_hub", move |conn, t| {
                conn.execute(
                    &format!(
                        "INSERT INTO {} (org_id, name, description, created_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        t.hubs
                    ),
                    rusqlite::params![org_id, name, description, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    /// Create a thread or a reply. Replies publish [`HubEvent::CommentPosted`] once committed.
    pub async fn create_post(&self, post: NewPost) -> Result<i64> {
        let now = self.clock.now();
        let user_id = post.user_id;
        let parent_id = post.parent_id;

        let id = self
            .db
            .transaction("hub.create_post", move |tx, t| -> Result<i64> {
                if let Some(parent_id) = post.parent_id {
                    let parent = load_post(tx, t, parent_id)?;
                    if !matches!(parent, Some(p) if p.hub_id == post.hub_id) {
                        return Err(ValidationError::ParentNotFound {
                            parent_id,
                            hub_id: post.hub_id,
                        }
                        .into());
                    }
                }
                tx.execute(
                    &format!(
                        "INSERT INTO {}
                            (hub_id, user_id, parent_id, title, content, post_type, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        t.posts
                    ),
                    rusqlite::params![
                        post.hub_id,
                        post.user_id,
                        post.parent_id,
                        post.title,
                        post.content,
                        post.post_type,
                        to_db_timestamp(now),
                    ],
                )?;
                Ok(tx.last_insert_rowid())
            })
            .await?;

        if let Some(post_id) = parent_id {
            info!(comment_id = id, post_id, user_id, "comment created");
            self.bus.publish(HubEvent::CommentPosted {
                user_id,
                comment_id: id,
                post_id,
                posted_at: now,
            });
        } else {
            info!(post_id = id, user_id, "thread created");
        }
        Ok(id)
    }

    /// One vote per (post, user). The first vote stands; later votes by the same user
    /// are ignored. Returns the post's score.
    pub async fn vote(&self, post_id: i64, user_id: i64, vote: VoteType) -> Result<i64> {
        let now = to_db_timestamp(self.clock.now());
        self.db
            .transaction("hub.vote", move |tx, t| -> Result<i64> {
                if load_post(tx, t, post_id)?.is_none() {
                    return Err(ValidationError::PostNotFound(post_id).into());
                }
                let inserted = tx.execute(
                    &format!(
                        "INSERT INTO {} (post_id, user_id, vote_type, created_at)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(post_id, user_id) DO NOTHING",
                        t.post_votes
                    ),
                    rusqlite::params![post_id, user_id, vote, now],
                )?;
                if inserted == 0 {
                    debug!(post_id, user_id, "repeat vote ignored");
                }
                Ok(post_score(tx, t, post_id)?)
            })
            .await
    }

    /// Bump the view counter and return the new count.
    pub async fn record_view(&self, post_id: i64) -> Result<i64> {
        let views: Option<i64> = self
            .db
            .call_named("hub.record_view", move |conn, t| {
                Ok(conn
                    .query_row(
                        &format!(
                            "UPDATE {} SET views = views + 1 WHERE id = ?1 RETURNING views",
                            t.posts
                        ),
                        [post_id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        views.ok_or_else(|| ValidationError::PostNotFound(post_id).into())
    }

    pub async fn set_moderation_status(
        &self,
        post_id: i64,
        status: ModerationStatus,
    ) -> Result<()> {
        let changed = self
            .db
            .call_named("hub.set_moderation_status", move |conn, t| {
                Ok(conn.execute(
                    &format!("UPDATE {} SET moderation_status = ?1 WHERE id = ?2", t.posts),
                    rusqlite::params![status, post_id],
                )?)
            })
            .await?;
        if changed == 0 {
            return Err(ValidationError::PostNotFound(post_id).into());
        }
        info!(post_id, status = status.as_str(), "moderation status updated");
        self.bus.publish(HubEvent::ModerationChanged {
            post_id,
            status,
            changed_at: self.clock.now(),
        });
        Ok(())
    }

    pub async fn comment_stats(&self, post_id: i64) -> Result<CommentStats> {
        let stats = self
            .db
            .call_named("hub.comment_stats", move |conn, t| {
                let Some(post) = load_post(conn, t, post_id)? else {
                    return Ok(None);
                };
                Ok(Some(CommentStats {
                    id: post.id,
                    user_id: post.user_id,
                    parent_id: post.parent_id,
                    score: post_score(conn, t, post_id)?,
                    views: post.views,
                    moderation_status: post.moderation_status,
                    created_at: post.created_at,
                }))
            })
            .await
            .map_err(LedgerError::from)?;
        stats.ok_or_else(|| ValidationError::PostNotFound(post_id).into())
    }

    /// Link a post to another item, such as a task or a course.
    pub async fn add_link(&self, post_id: i64, item_type: &str, item_id: i64) -> Result<i64> {
        let item_type = item_type.to_string();
        let now = to_db_timestamp(self.clock.now());
        self.db
            .transaction("hub.add_link", move |tx, t| -> Result<i64> {
                if load_post(tx, t, post_id)?.is_none() {
                    return Err(ValidationError::PostNotFound(post_id).into());
                }
                tx.execute(
                    &format!(
                        "INSERT INTO {} (post_id, item_type, item_id, created_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        t.post_links
                    ),
                    rusqlite::params![post_id, item_type, item_id, now],
                )?;
                Ok(tx.last_insert_rowid())
            })
            .await
    }

    pub async fn hubs_by_org(&self, org_id: i64) -> Result<Vec<HubSummary>> {
        let hubs = self
            .db
            .call_named("hub.hubs_by_org", move |conn, t| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT id, name, description FROM {} WHERE org_id = ?1 ORDER BY name, id",
                    t.hubs
                ))?;
                let rows = stmt.query_map([org_id], |row| {
                    Ok(HubSummary {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                    })
                })?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(hubs)
    }

    /// Top-level posts of a hub, newest first.
    pub async fn posts_by_hub(&self, hub_id: i64) -> Result<Vec<PostDetail>> {
        let posts = self
            .db
            .call_named("hub.posts_by_hub", move |conn, t| {
                let sql = post_detail_query(
                    t,
                    "WHERE p.hub_id = ?1 AND p.parent_id IS NULL
                     ORDER BY p.created_at DESC, p.id DESC",
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([hub_id], post_detail_from_row)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(posts)
    }

    /// A post with all its comments. Moderated-away comments are listed but never lead.
    pub async fn thread(&self, post_id: i64) -> Result<Thread> {
        let thread = self
            .db
            .call_named("hub.thread", move |conn, t| {
                let post = conn
                    .query_row(
                        &post_detail_query(t, "WHERE p.id = ?1"),
                        [post_id],
                        post_detail_from_row,
                    )
                    .optional()?;
                let Some(post) = post else {
                    return Ok(None);
                };
                let mut stmt = conn.prepare(&post_detail_query(
                    t,
                    "WHERE p.parent_id = ?1 ORDER BY p.created_at, p.id",
                ))?;
                let comments = stmt
                    .query_map([post_id], post_detail_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(Some((post, comments)))
            })
            .await?;
        let (post, comments) = thread.ok_or(ValidationError::PostNotFound(post_id))?;

        let visible: Vec<SiblingStats> = comments
            .iter()
            .filter(|c| !c.moderation_status.is_moderated_away())
            .map(|c| SiblingStats {
                id: c.id,
                score: c.score,
                views: c.views,
                created_at: c.created_at,
            })
            .collect();
        Ok(Thread {
            standings: rank_siblings(&visible),
            post,
            comments,
        })
    }
}
