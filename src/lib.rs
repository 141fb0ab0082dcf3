// ABOUTME: Change-log replication engine - captures row changes and replays them to a sink
// ABOUTME: Core is driver-agnostic; postgres and mysql adapters implement the connection traits

pub mod apply;
pub mod capture;
pub mod catalog;
pub mod config;
pub mod conn;
pub mod daemon;
pub mod envelope;
pub mod error;
pub mod mysql;
pub mod postgres;
pub mod sql;
pub mod value;

pub use error::{ReplicationError, Result};
