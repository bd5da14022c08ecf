//! Points ledger, comment investments and settlement for the discussion hub.
//!
//! Every write path goes through [`common::db::AsyncDb::transaction`], so a ledger
//! row and the balance it moves are always committed together.

pub mod error;
pub mod event_bus;
pub mod events;
pub mod hub;
pub mod investment;
pub mod points;
pub mod ranker;
pub mod streak;

pub use error::{LedgerError, ValidationError};
pub use investment::{InvestmentEngine, InvestmentSummary, SettlementSummary};
pub use points::PointsLedger;
