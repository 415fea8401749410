//! Bulk import of Pipedrive persons into the local store.
//!
//! A sync walks the persons selected by the account's "Still Active"
//! filter page by page (`start`/`limit`), reconciling each record with
//! [`Reconciler::reconcile_remote_person`]. Pages are processed strictly
//! in cursor order; a failing record is counted and categorized but never
//! stops the rest of the page.
//!
//! The sync fails outright only when the connection check, the filter
//! lookup, the schema discovery, or a page fetch fails, or when the token
//! expires mid-run. Cancellation is checked between pages and between
//! records; work already written is kept.
//!
//! Incremental syncs skip persons whose `update_time` is not newer than
//! the stored checkpoint. A completed sync advances the checkpoint to the
//! newest `update_time` it imported, but never past a person that failed,
//! so the next incremental run retries it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pipesync_core::error::{ApiErrorKind, SyncError};
use pipesync_core::progress::{SyncPhase, SyncProgressEvent, SyncProgressState, SyncType};
use pipesync_core::remote::{RemoteOrganization, RemoteFilter, RemotePerson};
use tokio_util::sync::CancellationToken;

use crate::client::PipedriveClient;
use crate::config::SyncConfig;
use crate::discovery::FieldContext;
use crate::progress::SyncProgressReporter;
use crate::reconcile::Reconciler;

/// Checkpoint key for the persons stream.
pub const CHECKPOINT_SOURCE: &str = "pipedrive:persons";

/// Filter type Pipedrive uses for person filters.
const PERSON_FILTER_TYPE: &str = "people";

pub struct BulkSync {
    reconciler: Arc<Reconciler>,
    config: SyncConfig,
}

/// Mutable state of one run, reported after every change.
struct Run<'a> {
    state: SyncProgressState,
    reporter: &'a dyn SyncProgressReporter,
}

impl Run<'_> {
    fn emit(&self) {
        self.reporter
            .report(&SyncProgressEvent::from_state(self.state.clone()));
    }

    fn fail(mut self, err: &SyncError) -> SyncProgressState {
        let now = Utc::now();
        self.state.push_error(err.category(), &err.to_string(), now);
        self.state.retry_suggestion = Some(err.retry_suggestion().to_string());
        self.state.finish(SyncPhase::Failed, now);
        tracing::warn!(sync_id = %self.state.sync_id, error = %err, "bulk sync failed");
        self.emit();
        self.state
    }

    fn cancel(mut self) -> SyncProgressState {
        self.state.finish(SyncPhase::Cancelled, Utc::now());
        tracing::info!(
            sync_id = %self.state.sync_id,
            processed = self.state.processed_records,
            "bulk sync cancelled"
        );
        self.emit();
        self.state
    }
}

impl BulkSync {
    pub fn new(reconciler: Arc<Reconciler>, config: SyncConfig) -> Self {
        Self { reconciler, config }
    }

    /// Fresh state for a new sync, as reported before the first page.
    pub fn initial_state(&self, sync_id: &str, sync_type: SyncType) -> SyncProgressState {
        SyncProgressState::new(sync_id, sync_type, Utc::now()).with_rate_window(self.config.rate_window)
    }

    /// Run a sync to completion, failure, or cancellation and return the
    /// terminal snapshot. Every intermediate snapshot goes to `reporter`.
    pub async fn run(
        &self,
        sync_id: &str,
        sync_type: SyncType,
        reporter: &dyn SyncProgressReporter,
        cancel: &CancellationToken,
    ) -> SyncProgressState {
        let mut run = Run {
            state: self.initial_state(sync_id, sync_type),
            reporter,
        };
        run.emit();
        tracing::info!(sync_id, ?sync_type, "bulk sync started");

        if cancel.is_cancelled() {
            return run.cancel();
        }

        let client = self.reconciler.client();
        let filter = match self.prepare(client).await {
            Ok(filter) => filter,
            Err(e) => return run.fail(&e),
        };
        let fields = match FieldContext::discover(client).await {
            Ok(fields) => fields,
            Err(e) => return run.fail(&e),
        };
        let checkpoint = match sync_type {
            SyncType::Full => None,
            SyncType::Incremental => match self.load_checkpoint().await {
                Ok(checkpoint) => checkpoint,
                Err(e) => return run.fail(&e),
            },
        };

        let page_size = self.config.page_size.max(1);
        let mut org_cache: HashMap<String, Option<RemoteOrganization>> = HashMap::new();
        let mut newest_seen = checkpoint;
        let mut oldest_failed: Option<DateTime<Utc>> = None;
        let mut start = 0u64;

        loop {
            if cancel.is_cancelled() {
                return run.cancel();
            }

            let page = match client
                .list_persons_page(Some(&filter.id), start, page_size)
                .await
            {
                Ok(page) => page,
                Err(e) => return run.fail(&SyncError::from(e)),
            };
            let now = Utc::now();
            run.state.begin_processing(now);
            run.state
                .note_rate_limited(page.diagnostics.rate_limited_retries, now);
            let fetched = page.fetched as u64;
            match page.total {
                Some(total) => run.state.set_total(total, now),
                None => run
                    .state
                    .set_total(start + fetched + u64::from(page.more_items == Some(true)), now),
            }
            tracing::debug!(sync_id, start, fetched, "fetched persons page");
            run.emit();

            for message in &page.rejected {
                run.state
                    .record_failure("unnamed record", "malformed_response", message, Utc::now());
                run.emit();
            }

            for person in &page.records {
                if cancel.is_cancelled() {
                    return run.cancel();
                }
                let label = person_label(person);

                if let (Some(since), Some(updated)) = (checkpoint, person.update_time) {
                    if updated <= since {
                        run.state.record_skip(label, Utc::now());
                        run.emit();
                        continue;
                    }
                }

                let org = self.organization_for(client, person, &mut org_cache).await;
                match self
                    .reconciler
                    .reconcile_remote_person(person, org.as_ref(), &fields)
                    .await
                {
                    Ok(_) => {
                        if let Some(updated) = person.update_time {
                            newest_seen = Some(newest_seen.map_or(updated, |n| n.max(updated)));
                        }
                        run.state.record_success(label, Utc::now());
                    }
                    Err(SyncError::Api(ApiErrorKind::AuthExpired)) => {
                        return run.fail(&SyncError::Api(ApiErrorKind::AuthExpired));
                    }
                    Err(e) => {
                        tracing::warn!(sync_id, remote_person_id = %person.id, error = %e, "person failed to sync");
                        if run.state.retry_suggestion.is_none() {
                            run.state.retry_suggestion = Some(e.retry_suggestion().to_string());
                        }
                        if let Some(updated) = person.update_time {
                            oldest_failed = Some(oldest_failed.map_or(updated, |o| o.min(updated)));
                        }
                        run.state
                            .record_failure(label, e.category(), &e.to_string(), Utc::now());
                    }
                }
                run.emit();
            }

            if fetched < page_size || page.more_items == Some(false) {
                break;
            }
            start += fetched;
        }

        let advance_to = next_checkpoint(checkpoint, newest_seen, oldest_failed);
        if let Some(newest) = advance_to {
            if advance_to != checkpoint {
                if let Err(e) = self
                    .reconciler
                    .store()
                    .set_checkpoint(CHECKPOINT_SOURCE, &newest.to_rfc3339())
                    .await
                {
                    tracing::warn!(sync_id, error = %e, "could not store sync checkpoint");
                    run.state.push_error("store", &e.to_string(), Utc::now());
                }
            }
        }

        run.state.finish(SyncPhase::Completed, Utc::now());
        tracing::info!(
            sync_id,
            succeeded = run.state.succeeded_records,
            skipped = run.state.skipped_records,
            failed = run.state.failed_records,
            "bulk sync completed"
        );
        run.emit();
        run.state
    }

    /// Connection check plus the required person filter.
    async fn prepare(&self, client: &PipedriveClient) -> Result<RemoteFilter, SyncError> {
        let me = client.me().await?;
        tracing::debug!(remote_user_id = %me.id, "Pipedrive connection verified");

        let wanted = self.config.active_filter_name.trim().to_lowercase();
        client
            .list_filters(PERSON_FILTER_TYPE)
            .await?
            .into_iter()
            .find(|f| f.name.trim().to_lowercase() == wanted)
            .ok_or_else(|| {
                SyncError::Configuration(format!(
                    "Pipedrive has no person filter named \"{}\"; create it to select the persons to sync",
                    self.config.active_filter_name
                ))
            })
    }

    async fn load_checkpoint(&self) -> Result<Option<DateTime<Utc>>, SyncError> {
        let raw = self
            .reconciler
            .store()
            .get_checkpoint(CHECKPOINT_SOURCE)
            .await?;
        Ok(raw.and_then(|s| match DateTime::parse_from_rfc3339(&s) {
            Ok(dt) => Some(dt.with_timezone(&Utc)),
            Err(e) => {
                tracing::warn!(checkpoint = %s, error = %e, "ignoring unreadable checkpoint");
                None
            }
        }))
    }

    /// The person's organization, fetched once per sync. Lookup failures
    /// degrade to the name carried on the person.
    async fn organization_for(
        &self,
        client: &PipedriveClient,
        person: &RemotePerson,
        cache: &mut HashMap<String, Option<RemoteOrganization>>,
    ) -> Option<RemoteOrganization> {
        let org_id = person.org_id.as_deref()?;
        if let Some(cached) = cache.get(org_id) {
            return cached.clone();
        }
        let fetched = match client.get_organization(org_id).await {
            Ok(org) => org,
            Err(e) => {
                tracing::warn!(remote_org_id = org_id, error = %e, "organization lookup failed");
                None
            }
        };
        cache.insert(org_id.to_string(), fetched.clone());
        fetched
    }
}

fn person_label(person: &RemotePerson) -> String {
    if person.name.trim().is_empty() {
        format!("person {}", person.id)
    } else {
        person.name.clone()
    }
}

/// Where the checkpoint moves after a completed sync: the newest imported
/// `update_time`, held just below the oldest failure and never behind the
/// previous checkpoint.
fn next_checkpoint(
    previous: Option<DateTime<Utc>>,
    newest_imported: Option<DateTime<Utc>>,
    oldest_failed: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    let Some(failed) = oldest_failed else {
        return newest_imported;
    };
    let below_failure = failed - chrono::Duration::milliseconds(1);
    let candidate = newest_imported.map(|n| n.min(below_failure));
    match (candidate, previous) {
        (Some(c), Some(p)) => Some(c.max(p)),
        (c, p) => c.or(p),
    }
}
