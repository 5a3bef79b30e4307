use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::db::ChangeEvent;
use crate::error::RegistryError;

/// Something that re-reads its state from the store when the store changes.
#[async_trait]
pub trait Refreshable: Send + Sync + 'static {
    /// Short label used in logs.
    fn name(&self) -> &'static str;

    /// Whether this event should trigger a refresh.
    fn wants(&self, event: &ChangeEvent) -> bool;

    async fn refresh(&self) -> Result<(), RegistryError>;
}

/// Background listener bound to one refreshable target.
///
/// Dropping the subscription stops the listener.
#[derive(Debug)]
pub struct Subscription {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawn a task that refreshes `target` whenever the feed carries an event it
/// wants.
///
/// Events already queued when a refresh is about to start are folded into
/// that refresh. A lagged receiver has lost events it cannot inspect, so it
/// refreshes once unconditionally. The task ends when the feed closes.
pub fn spawn_feed_listener<R>(
    target: Arc<R>,
    mut changes: broadcast::Receiver<ChangeEvent>,
) -> Subscription
where
    R: Refreshable + ?Sized,
{
    let name = target.name();
    let handle = tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(event) if target.wants(&event) => {}
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(target_name = name, skipped, "change feed lagged");
                }
                Err(RecvError::Closed) => break,
            }

            let mut closed = false;
            loop {
                match changes.try_recv() {
                    Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Closed) => {
                        closed = true;
                        break;
                    }
                }
            }

            if let Err(e) = target.refresh().await {
                warn!(target_name = name, error = %e, "refresh after change failed");
            }
            if closed {
                break;
            }
        }
        debug!(target_name = name, "change listener stopped");
    });
    Subscription { name, handle }
}
