use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Moderation state of a post. Set by the moderation collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationStatus {
    Pending,
    Approved,
    Flagged,
    Removed,
}

impl ModerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Flagged => "flagged",
            Self::Removed => "removed",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "flagged" => Some(Self::Flagged),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }

    /// Flagged and removed content can neither be staked nor win a settlement.
    pub fn is_moderated_away(&self) -> bool {
        matches!(self, Self::Flagged | Self::Removed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestmentStatus {
    Pending,
    Won,
    Lost,
    Cancelled,
}

impl InvestmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Won => "won",
            Self::Lost => "lost",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "won" => Some(Self::Won),
            "lost" => Some(Self::Lost),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Why a ledger row exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    InvestStake,
    InvestPayout,
    CommentStreak,
    Adjustment,
}

impl LedgerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvestStake => "invest_stake",
            Self::InvestPayout => "invest_payout",
            Self::CommentStreak => "comment_streak",
            Self::Adjustment => "adjustment",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "invest_stake" => Some(Self::InvestStake),
            "invest_payout" => Some(Self::InvestPayout),
            "comment_streak" => Some(Self::CommentStreak),
            "adjustment" => Some(Self::Adjustment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteType {
    Up,
    Down,
}

impl VoteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            _ => None,
        }
    }
}

// The four enums above are persisted as their `as_str` text.
macro_rules! sql_text_enum {
    ($ty:ident, $kind:literal) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_str_loose(s).ok_or_else(|| UnknownVariant {
                    kind: $kind,
                    value: s.to_string(),
                })
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let s = value.as_str()?;
                s.parse().map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

sql_text_enum!(ModerationStatus, "moderation status");
sql_text_enum!(InvestmentStatus, "investment status");
sql_text_enum!(LedgerReason, "ledger reason");
sql_text_enum!(VoteType, "vote type");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moderation_status_moderated_away() {
        assert!(ModerationStatus::Flagged.is_moderated_away());
        assert!(ModerationStatus::Removed.is_moderated_away());
        assert!(!ModerationStatus::Pending.is_moderated_away());
        assert!(!ModerationStatus::Approved.is_moderated_away());
    }

    #[test]
    fn test_investment_status_display_and_parse() {
        assert_eq!(InvestmentStatus::Won.to_string(), "won");
        assert_eq!(
            "cancelled".parse::<InvestmentStatus>().unwrap(),
            InvestmentStatus::Cancelled
        );
        assert!(InvestmentStatus::Lost.is_terminal());
        assert!(!InvestmentStatus::Pending.is_terminal());
    }

    #[test]
    fn test_unknown_reason_is_error() {
        let err = "bonus".parse::<LedgerReason>().unwrap_err();
        assert_eq!(err.kind, "ledger reason");
        assert!(err.to_string().contains("bonus"));
    }

    #[test]
    fn test_vote_type_loose_parse() {
        assert_eq!(VoteType::from_str_loose("UP"), Some(VoteType::Up));
        assert_eq!(VoteType::from_str_loose("helpful"), None);
    }

    #[test]
    fn test_enums_round_trip_through_sqlite() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let reason: LedgerReason = conn
            .query_row("SELECT ?1", [LedgerReason::InvestPayout], |row| row.get(0))
            .unwrap();
        assert_eq!(reason, LedgerReason::InvestPayout);

        let bad: rusqlite::Result<ModerationStatus> =
            conn.query_row("SELECT 'spam'", [], |row| row.get(0));
        assert!(bad.is_err());
    }
}
