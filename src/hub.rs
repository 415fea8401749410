//! Registry of running and recently finished bulk syncs.
//!
//! `start` spawns the sync on the runtime and returns its id at once.
//! Subscribers attach by id and receive every subsequent snapshot over a
//! broadcast channel; the latest snapshot is always available for late
//! joiners. Finished syncs linger for `retain_finished_secs` before they
//! are dropped.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use pipesync_core::progress::{SyncProgressEvent, SyncType};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bulk_sync::BulkSync;
use crate::progress::ChannelReporter;

struct SyncHandle {
    reporter: ChannelReporter,
    cancel: CancellationToken,
}

pub struct SyncHub {
    sync: Arc<BulkSync>,
    syncs: Arc<DashMap<String, SyncHandle>>,
    retain_finished: Duration,
}

impl SyncHub {
    pub fn new(sync: Arc<BulkSync>, retain_finished: Duration) -> Self {
        Self {
            sync,
            syncs: Arc::new(DashMap::new()),
            retain_finished,
        }
    }

    /// Start a sync in the background and return its id.
    pub fn start(&self, sync_type: SyncType) -> String {
        let sync_id = Uuid::new_v4().to_string();
        let reporter = ChannelReporter::new(self.sync.initial_state(&sync_id, sync_type));
        let cancel = CancellationToken::new();
        self.syncs.insert(
            sync_id.clone(),
            SyncHandle {
                reporter: reporter.clone(),
                cancel: cancel.clone(),
            },
        );

        let sync = self.sync.clone();
        let syncs = self.syncs.clone();
        let retain = self.retain_finished;
        let id = sync_id.clone();
        tokio::spawn(async move {
            let state = sync.run(&id, sync_type, &reporter, &cancel).await;
            tracing::debug!(sync_id = %id, status = ?state.status, "sync finished; retaining snapshot");
            tokio::time::sleep(retain).await;
            syncs.remove(&id);
        });
        sync_id
    }

    /// Latest snapshot of a known sync.
    pub fn latest(&self, sync_id: &str) -> Option<SyncProgressEvent> {
        self.syncs.get(sync_id).map(|h| h.reporter.latest())
    }

    /// The latest snapshot plus a receiver for everything after it.
    pub fn subscribe(
        &self,
        sync_id: &str,
    ) -> Option<(SyncProgressEvent, broadcast::Receiver<SyncProgressEvent>)> {
        self.syncs.get(sync_id).map(|h| {
            let rx = h.reporter.subscribe();
            (h.reporter.latest(), rx)
        })
    }

    /// Request cancellation. Returns false for unknown ids.
    pub fn cancel(&self, sync_id: &str) -> bool {
        match self.syncs.get(sync_id) {
            Some(handle) => {
                handle.cancel.cancel();
                tracing::info!(sync_id, "sync cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Ids of syncs that have not reached a terminal state.
    pub fn running(&self) -> Vec<String> {
        self.syncs
            .iter()
            .filter(|entry| !entry.value().reporter.latest().is_terminal())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Register an externally driven reporter, used by tests.
    #[cfg(test)]
    fn insert(&self, sync_id: &str, reporter: ChannelReporter) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.syncs.insert(
            sync_id.to_string(),
            SyncHandle {
                reporter,
                cancel: cancel.clone(),
            },
        );
        cancel
    }
}

/// Next event from a subscription, skipping over lag.
pub async fn next_event(rx: &mut broadcast::Receiver<SyncProgressEvent>) -> Option<SyncProgressEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "progress subscriber lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PipedriveClient;
    use crate::config::{PipedriveConfig, SyncConfig};
    use crate::progress::SyncProgressReporter;
    use crate::reconcile::Reconciler;
    use chrono::Utc;
    use mockito::Matcher;
    use pipesync_core::progress::{SyncPhase, SyncProgressState};
    use pipesync_core::sanitize::SanitizeLimits;
    use pipesync_core::store::memory::InMemoryStore;

    fn hub(base_url: String, retain: Duration) -> SyncHub {
        let config = PipedriveConfig {
            base_url,
            max_retries: 0,
            ..PipedriveConfig::default()
        };
        let client = PipedriveClient::new(&config, "t").unwrap();
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(InMemoryStore::new()),
            client,
            SanitizeLimits::default(),
        ));
        let sync = Arc::new(BulkSync::new(reconciler, SyncConfig::default()));
        SyncHub::new(sync, retain)
    }

    #[tokio::test]
    async fn test_failed_sync_reaches_subscriber_then_expires() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/users/me")
            .match_query(Matcher::Any)
            .with_status(401)
            .create_async()
            .await;

        let hub = hub(server.url(), Duration::from_millis(200));
        let id = hub.start(SyncType::Full);

        let mut terminal = None;
        for _ in 0..100 {
            match hub.latest(&id) {
                Some(event) if event.is_terminal() => {
                    terminal = Some(event);
                    break;
                }
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        let terminal = terminal.expect("sync should finish");
        assert_eq!(terminal.event_name(), "error");
        assert_eq!(terminal.state().status, SyncPhase::Failed);
        assert!(hub.running().is_empty());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(hub.latest(&id).is_none());
    }

    #[tokio::test]
    async fn test_subscribe_and_cancel() {
        let hub = hub("http://127.0.0.1:1".into(), Duration::from_secs(60));
        let now = Utc::now();
        let reporter = ChannelReporter::new(SyncProgressState::new("s1", SyncType::Full, now));
        let cancel = hub.insert("s1", reporter.clone());

        let (first, mut rx) = hub.subscribe("s1").unwrap();
        assert_eq!(first.event_name(), "progress");
        assert_eq!(hub.running(), vec!["s1".to_string()]);

        assert!(hub.cancel("s1"));
        assert!(cancel.is_cancelled());
        assert!(!hub.cancel("nope"));

        let mut state = SyncProgressState::new("s1", SyncType::Full, now);
        state.finish(SyncPhase::Cancelled, now);
        reporter.report(&SyncProgressEvent::from_state(state));
        let event = next_event(&mut rx).await.unwrap();
        assert_eq!(event.event_name(), "cancelled");
        assert!(hub.subscribe("nope").is_none());
    }
}
