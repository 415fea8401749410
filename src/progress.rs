//! Bulk sync progress delivery.
//!
//! The sync loop only knows the [`SyncProgressReporter`] trait. The
//! server hands it a [`ChannelReporter`] that fans snapshots out over a
//! broadcast channel; the CLI uses one of the stderr reporters. Progress
//! goes to **stderr** so stdout stays parseable for scripts.

use std::io::Write;
use std::sync::Arc;

use parking_lot::RwLock;
use pipesync_core::progress::{SyncProgressEvent, SyncProgressState};
use tokio::sync::broadcast;

/// Capacity of each sync's broadcast channel. Slow subscribers that lag
/// behind skip to the newest snapshot.
pub const CHANNEL_CAPACITY: usize = 256;

/// Receives progress events from a running bulk sync.
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: &SyncProgressEvent);
}

/// Fans events out to subscribers and remembers the latest snapshot.
#[derive(Clone)]
pub struct ChannelReporter {
    sender: broadcast::Sender<SyncProgressEvent>,
    latest: Arc<RwLock<SyncProgressEvent>>,
}

impl ChannelReporter {
    pub fn new(initial: SyncProgressState) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            latest: Arc::new(RwLock::new(SyncProgressEvent::from_state(initial))),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncProgressEvent> {
        self.sender.subscribe()
    }

    pub fn latest(&self) -> SyncProgressEvent {
        self.latest.read().clone()
    }
}

impl SyncProgressReporter for ChannelReporter {
    fn report(&self, event: &SyncProgressEvent) {
        *self.latest.write() = event.clone();
        // No subscribers is fine; the snapshot is still kept.
        let _ = self.sender.send(event.clone());
    }
}

/// Human-friendly progress on stderr:
/// `sync 4f1c…  processing  1,234 / 5,000 records (24.7%)  ~3m left`.
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: &SyncProgressEvent) {
        let state = event.state();
        let short_id: String = state.sync_id.chars().take(8).collect();
        let mut line = match event {
            SyncProgressEvent::Progress(_) => format!(
                "sync {}  processing  {} / {} records ({:.1}%)",
                short_id,
                format_number(state.processed_records),
                format_number(state.total_records),
                state.percentage
            ),
            SyncProgressEvent::Complete(_) => format!(
                "sync {}  complete  {} synced, {} skipped, {} failed",
                short_id,
                format_number(state.succeeded_records),
                format_number(state.skipped_records),
                format_number(state.failed_records)
            ),
            SyncProgressEvent::Error(_) => format!(
                "sync {}  failed  {}",
                short_id,
                state.errors.last().map(String::as_str).unwrap_or("unknown error")
            ),
            SyncProgressEvent::Cancelled(_) => format!(
                "sync {}  cancelled after {} records",
                short_id,
                format_number(state.processed_records)
            ),
        };
        if let (false, Some(secs)) = (event.is_terminal(), state.estimated_time_remaining) {
            line.push_str(&format!("  ~{} left", format_duration(secs)));
        }
        if state.rate_limited && !event.is_terminal() {
            line.push_str("  (rate limited)");
        }
        line.push('\n');
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON event per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: &SyncProgressEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: &SyncProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

fn format_duration(secs: u64) -> String {
    match secs {
        0..=59 => format!("{}s", secs),
        60..=3599 => format!("{}m", secs.div_ceil(60)),
        _ => format!("{}h{}m", secs / 3600, (secs % 3600) / 60),
    }
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Arc<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}
