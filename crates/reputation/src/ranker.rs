//! Settlement ranking over sibling comments.
//!
//! A stake wins only when its comment leads the thread on two independent axes at
//! once: vote score and views.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;

/// Ranking inputs for one comment under a parent post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiblingStats {
    pub id: i64,
    pub score: i64,
    pub views: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Standings {
    pub top_by_score: Option<i64>,
    pub top_by_views: Option<i64>,
}

impl Standings {
    /// True when `comment_id` holds both top spots.
    pub fn is_double_top(&self, comment_id: i64) -> bool {
        self.top_by_score == Some(comment_id) && self.top_by_views == Some(comment_id)
    }
}

// Earlier creation wins ties; the lower id breaks exact timestamp ties.
fn seniority(a: &SiblingStats, b: &SiblingStats) -> Ordering {
    a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id))
}

/// `Less` means `a` ranks ahead of `b` on the score axis.
fn score_order(a: &SiblingStats, b: &SiblingStats) -> Ordering {
    b.score
        .cmp(&a.score)
        .then(b.views.cmp(&a.views))
        .then_with(|| seniority(a, b))
}

/// `Less` means `a` ranks ahead of `b` on the views axis.
fn views_order(a: &SiblingStats, b: &SiblingStats) -> Ordering {
    b.views
        .cmp(&a.views)
        .then(b.score.cmp(&a.score))
        .then_with(|| seniority(a, b))
}

/// Leaders of a sibling set. Total: an empty slice has no leader on either axis.
pub fn rank_siblings(siblings: &[SiblingStats]) -> Standings {
    Standings {
        top_by_score: siblings.iter().min_by(|a, b| score_order(a, b)).map(|s| s.id),
        top_by_views: siblings.iter().min_by(|a, b| views_order(a, b)).map(|s| s.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 12, minute, 0).unwrap()
    }

    fn sib(id: i64, score: i64, views: i64, minute: u32) -> SiblingStats {
        SiblingStats {
            id,
            score,
            views,
            created_at: at(minute),
        }
    }

    #[test]
    fn test_empty_set_has_no_leaders() {
        let standings = rank_siblings(&[]);
        assert_eq!(standings, Standings::default());
        assert!(!standings.is_double_top(1));
    }

    #[test]
    fn test_single_comment_leads_both_axes() {
        let standings = rank_siblings(&[sib(7, 0, 0, 0)]);
        assert!(standings.is_double_top(7));
    }

    #[test]
    fn test_score_tie_broken_by_views() {
        // A: score 5 / views 10, B: score 5 / views 20 -> B leads both.
        let standings = rank_siblings(&[sib(1, 5, 10, 0), sib(2, 5, 20, 1)]);
        assert_eq!(standings.top_by_score, Some(2));
        assert_eq!(standings.top_by_views, Some(2));
        assert!(standings.is_double_top(2));
        assert!(!standings.is_double_top(1));
    }

    #[test]
    fn test_axes_can_disagree() {
        let standings = rank_siblings(&[sib(1, 9, 3, 0), sib(2, 1, 50, 1)]);
        assert_eq!(standings.top_by_score, Some(1));
        assert_eq!(standings.top_by_views, Some(2));
        assert!(!standings.is_double_top(1));
        assert!(!standings.is_double_top(2));
    }

    #[test]
    fn test_views_tie_broken_by_score() {
        let standings = rank_siblings(&[sib(1, 2, 40, 0), sib(2, 3, 40, 5)]);
        assert_eq!(standings.top_by_views, Some(2));
        assert_eq!(standings.top_by_score, Some(2));
    }

    #[test]
    fn test_full_tie_goes_to_earliest() {
        let standings = rank_siblings(&[sib(3, 4, 4, 9), sib(4, 4, 4, 2), sib(5, 4, 4, 30)]);
        assert_eq!(standings.top_by_score, Some(4));
        assert_eq!(standings.top_by_views, Some(4));
    }

    #[test]
    fn test_identical_timestamps_fall_back_to_lower_id() {
        let standings = rank_siblings(&[sib(12, 1, 1, 0), sib(11, 1, 1, 0)]);
        assert!(standings.is_double_top(11));
    }

    #[test]
    fn test_order_of_input_does_not_matter() {
        let mut siblings = vec![sib(1, 3, 8, 0), sib(2, 3, 8, 1), sib(3, -2, 100, 2)];
        let forward = rank_siblings(&siblings);
        siblings.reverse();
        assert_eq!(rank_siblings(&siblings), forward);
        assert_eq!(forward.top_by_score, Some(1));
        assert_eq!(forward.top_by_views, Some(3));
    }
}
