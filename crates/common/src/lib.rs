pub mod clock;
pub mod config;
pub mod db;
pub mod observability;
pub mod types;
