//! Account consolidation engine.
//!
//! Folds a set of individual accounts into one consolidated account per
//! group, and reverses, re-keys or repairs such groups. Every mutation is
//! planned first, written with per-field backups, and applied in a single
//! store transaction.

pub mod backup;
pub mod commands;
pub mod config;
pub mod db;
pub mod db_backup;
pub mod error;
pub mod executor;
pub mod merge;
mod migrations;
pub mod plan;
pub mod planner;
pub mod repair;
pub mod reversal;
pub mod swap;
pub mod types;
pub mod verify;
