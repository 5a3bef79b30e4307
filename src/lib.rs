//! casedesk: client and document records for a small office, kept in sync
//! with a shared remote store.
//!
//! The registries in [`registry`] hold session-local snapshots of the
//! store's rows. [`session::Session`] wires them to the store's change feed
//! so writes from any session show up everywhere.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod registry;
pub mod reports;
pub mod session;
pub mod storage;
pub mod sync;
pub mod validation;
