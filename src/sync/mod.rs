//! Snapshot sequencing and change-feed listeners shared by the registries.

mod feed;
mod snapshot;

pub use feed::{Refreshable, Subscription, spawn_feed_listener};
pub use snapshot::{RefreshTicket, SnapshotCell};
