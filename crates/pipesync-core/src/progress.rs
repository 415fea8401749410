//! Bulk sync progress state and arithmetic.
//!
//! A [`SyncProgressState`] is created when a sync starts, mutated after
//! every processed record, and frozen once its status leaves
//! `processing`. Every [`SyncProgressEvent`] carries a full snapshot, so
//! a subscriber that misses intermediate events still sees accurate
//! totals on the next one.
//!
//! # Derived values
//!
//! - `percentage = processed / total × 100`, `0` while the total is
//!   unknown, clamped to `100`.
//! - `processing_speed` is records/second over a rolling window of the
//!   most recent record completions (overall average until the window
//!   has two points).
//! - `estimated_time_remaining = ceil((total − processed) / speed)`
//!   seconds, absent while the speed or total is unknown.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default rolling-window size for the speed estimate.
pub const DEFAULT_RATE_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncType {
    Full,
    Incremental,
}

/// Lifecycle of a bulk sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    /// Created, first page not fetched yet.
    Starting,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl SyncPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncPhase::Completed | SyncPhase::Failed | SyncPhase::Cancelled
        )
    }
}

/// Full snapshot of a running or finished bulk sync.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgressState {
    pub sync_id: String,
    pub sync_type: SyncType,
    pub status: SyncPhase,
    /// `0` while unknown.
    pub total_records: u64,
    pub processed_records: u64,
    pub succeeded_records: u64,
    pub failed_records: u64,
    pub skipped_records: u64,
    pub current_record_label: Option<String>,
    pub percentage: f64,
    /// Records per second.
    pub processing_speed: f64,
    /// Seconds.
    pub estimated_time_remaining: Option<u64>,
    /// In occurrence order.
    pub errors: Vec<String>,
    /// Error category → count.
    pub error_summary: BTreeMap<String, u64>,
    pub rate_limited: bool,
    pub rate_limit_hits: u64,
    pub retry_suggestion: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    window: VecDeque<DateTime<Utc>>,
    #[serde(skip)]
    window_size: usize,
}

impl SyncProgressState {
    pub fn new(sync_id: impl Into<String>, sync_type: SyncType, now: DateTime<Utc>) -> Self {
        Self {
            sync_id: sync_id.into(),
            sync_type,
            status: SyncPhase::Starting,
            total_records: 0,
            processed_records: 0,
            succeeded_records: 0,
            failed_records: 0,
            skipped_records: 0,
            current_record_label: None,
            percentage: 0.0,
            processing_speed: 0.0,
            estimated_time_remaining: None,
            errors: Vec::new(),
            error_summary: BTreeMap::new(),
            rate_limited: false,
            rate_limit_hits: 0,
            retry_suggestion: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
            window: VecDeque::new(),
            window_size: DEFAULT_RATE_WINDOW,
        }
    }

    pub fn with_rate_window(mut self, window_size: usize) -> Self {
        self.window_size = window_size.max(2);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move from `starting` to `processing`. No-op in any other phase.
    pub fn begin_processing(&mut self, now: DateTime<Utc>) {
        if self.status == SyncPhase::Starting {
            self.status = SyncPhase::Processing;
            self.updated_at = now;
        }
    }

    /// Raise the known total. Totals never shrink below what was processed.
    pub fn set_total(&mut self, total: u64, now: DateTime<Utc>) {
        self.total_records = total.max(self.processed_records);
        self.recompute(now);
    }

    pub fn note_rate_limited(&mut self, hits: u32, now: DateTime<Utc>) {
        if hits == 0 {
            return;
        }
        self.rate_limited = true;
        self.rate_limit_hits += u64::from(hits);
        self.retry_suggestion =
            Some("Rate limited by Pipedrive, will resume automatically.".to_string());
        self.updated_at = now;
    }

    pub fn record_success(&mut self, label: impl Into<String>, now: DateTime<Utc>) {
        self.succeeded_records += 1;
        self.advance(label.into(), now);
    }

    pub fn record_skip(&mut self, label: impl Into<String>, now: DateTime<Utc>) {
        self.skipped_records += 1;
        self.advance(label.into(), now);
    }

    /// Count a failed record; the sync keeps going.
    pub fn record_failure(
        &mut self,
        label: impl Into<String>,
        category: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        let label = label.into();
        self.failed_records += 1;
        self.errors
            .push(format!("[{}] {}: {}", category, label, message));
        *self.error_summary.entry(category.to_string()).or_insert(0) += 1;
        self.advance(label, now);
    }

    /// Add a sync-level error without counting a record.
    pub fn push_error(&mut self, category: &str, message: &str, now: DateTime<Utc>) {
        self.errors.push(format!("[{}] {}", category, message));
        *self.error_summary.entry(category.to_string()).or_insert(0) += 1;
        self.updated_at = now;
    }

    /// Freeze the state in a terminal phase.
    pub fn finish(&mut self, phase: SyncPhase, now: DateTime<Utc>) {
        self.status = phase;
        if phase == SyncPhase::Completed {
            self.total_records = self.processed_records;
            self.estimated_time_remaining = Some(0);
        }
        self.current_record_label = None;
        self.recompute(now);
        if phase == SyncPhase::Completed {
            self.percentage = 100.0;
        }
        self.finished_at = Some(now);
    }

    /// True when at least one record failed and at least one succeeded.
    pub fn is_partial_success(&self) -> bool {
        self.failed_records > 0 && self.succeeded_records > 0
    }

    fn advance(&mut self, label: String, now: DateTime<Utc>) {
        self.processed_records += 1;
        if self.total_records < self.processed_records {
            self.total_records = self.processed_records;
        }
        self.current_record_label = Some(label);
        self.window.push_back(now);
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }
        self.recompute(now);
    }

    fn recompute(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.percentage = percentage(self.processed_records, self.total_records);
        self.processing_speed = self.rolling_speed(now);
        if self.status.is_terminal() {
            return;
        }
        self.estimated_time_remaining =
            estimate_remaining(self.processed_records, self.total_records, self.processing_speed);
    }

    fn rolling_speed(&self, now: DateTime<Utc>) -> f64 {
        if let (Some(first), Some(last)) = (self.window.front(), self.window.back()) {
            let span = (*last - *first).num_milliseconds() as f64 / 1000.0;
            if self.window.len() >= 2 && span > 0.0 {
                return (self.window.len() - 1) as f64 / span;
            }
        }
        let elapsed = (now - self.started_at).num_milliseconds() as f64 / 1000.0;
        if elapsed > 0.0 {
            self.processed_records as f64 / elapsed
        } else {
            0.0
        }
    }
}

/// `processed / total × 100`, guarded against an unknown (zero) total.
pub fn percentage(processed: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((processed as f64 / total as f64) * 100.0).min(100.0)
}

/// Seconds left at the current speed, if both speed and total are known.
pub fn estimate_remaining(processed: u64, total: u64, speed: f64) -> Option<u64> {
    if total == 0 || speed <= 0.0 {
        return None;
    }
    let remaining = total.saturating_sub(processed);
    Some((remaining as f64 / speed).ceil() as u64)
}

/// A typed progress notification. Every variant carries the full state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "state", rename_all = "lowercase")]
pub enum SyncProgressEvent {
    Progress(SyncProgressState),
    Complete(SyncProgressState),
    Error(SyncProgressState),
    Cancelled(SyncProgressState),
}

impl SyncProgressEvent {
    /// Wrap a snapshot in the event its phase calls for.
    pub fn from_state(state: SyncProgressState) -> Self {
        match state.status {
            SyncPhase::Completed => SyncProgressEvent::Complete(state),
            SyncPhase::Failed => SyncProgressEvent::Error(state),
            SyncPhase::Cancelled => SyncProgressEvent::Cancelled(state),
            SyncPhase::Starting | SyncPhase::Processing => SyncProgressEvent::Progress(state),
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            SyncProgressEvent::Progress(_) => "progress",
            SyncProgressEvent::Complete(_) => "complete",
            SyncProgressEvent::Error(_) => "error",
            SyncProgressEvent::Cancelled(_) => "cancelled",
        }
    }

    pub fn state(&self) -> &SyncProgressState {
        match self {
            SyncProgressEvent::Progress(s)
            | SyncProgressEvent::Complete(s)
            | SyncProgressEvent::Error(s)
            | SyncProgressEvent::Cancelled(s) => s,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SyncProgressEvent::Progress(_))
    }
}
