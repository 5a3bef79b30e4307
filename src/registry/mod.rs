//! Session-local views over the remote store.
//!
//! Each registry holds a snapshot that is replaced wholesale on refresh, and
//! re-reads it after every successful write of its own. The same refresh is
//! driven by the change feed for writes made elsewhere.

mod audit_trail;
mod clients;
mod documents;
mod stats;

pub use audit_trail::{AuditFilter, AuditTrailReader};
pub use clients::ClientRegistry;
pub use documents::{DocumentFilter, DocumentRegistry, NewUpload};
pub use stats::StatsAggregator;

use tracing::warn;

use crate::sync::Refreshable;

/// Refresh after a committed write.
///
/// The write already succeeded and the feed will trigger another refresh, so
/// a failure here is logged rather than returned.
pub(crate) async fn refresh_after_write<R: Refreshable + ?Sized>(target: &R) {
    if let Err(e) = target.refresh().await {
        warn!(target_name = target.name(), error = %e, "refresh after write failed");
    }
}
