//! Events published by the hub store after a write has committed.
//!
//! Subscribers run outside the publisher's transaction. A subscriber failure never
//! undoes the write that produced the event.

pub mod subscribers;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    /// A reply was created under `post_id`.
    CommentPosted {
        user_id: i64,
        comment_id: i64,
        post_id: i64,
        posted_at: DateTime<Utc>,
    },

    /// A moderation decision landed on a post or comment.
    ModerationChanged {
        post_id: i64,
        status: common::types::ModerationStatus,
        changed_at: DateTime<Utc>,
    },
}

impl HubEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CommentPosted { .. } => "comment_posted",
            Self::ModerationChanged { .. } => "moderation_changed",
        }
    }
}
