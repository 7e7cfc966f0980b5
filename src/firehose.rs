//! The subscribeRepos firehose
//!
//! Publishes every persisted event to subscribers in strict ascending
//! sequence order. Each subscriber gets its own pump task reading the event
//! log, so a slow consumer can only ever stall itself. Pumps park on the
//! storage notifier and additionally poll at a fixed interval in case the
//! producer lives in another process.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use crate::error::{RepoError, Result};
use crate::event::Frame;
use crate::storage::RepoStorage;

/// How long a pump waits for a skipped sequence number before emitting a
/// gap marker and moving on. Not configurable.
pub const GAP_TIMEOUT: Duration = Duration::from_secs(60);

/// Safety poll interval while idle; the notifier is the primary wakeup
const IDLE_POLL: Duration = Duration::from_secs(5);

/// Consecutive storage failures tolerated before disconnecting a subscriber
const MAX_STORAGE_FAILURES: u32 = 5;

/// Firehose configuration
#[derive(Debug, Clone)]
pub struct FirehoseConfig {
    /// Maximum number of events replayable to late subscribers; `None`
    /// means unlimited
    pub rollback_window: Option<u64>,

    /// Minimum delay between event-log queries
    pub batch_delay: Duration,
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        Self {
            rollback_window: None,
            batch_delay: Duration::ZERO,
        }
    }
}

impl FirehoseConfig {
    /// Read configuration from the environment
    ///
    /// `ROLLBACK_WINDOW` (integer events) and `SUBSCRIBE_BATCH_DELAY`
    /// (float seconds); both optional.
    pub fn from_env() -> Self {
        let rollback_window = std::env::var("ROLLBACK_WINDOW")
            .ok()
            .and_then(|v| v.parse().ok());
        let batch_delay = std::env::var("SUBSCRIBE_BATCH_DELAY")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::ZERO);

        Self {
            rollback_window,
            batch_delay,
        }
    }
}

/// What a subscriber receives
#[derive(Debug, Clone)]
pub enum FirehoseItem {
    /// A serialized event frame
    Frame {
        /// Sequence number of the underlying event
        seq: u64,
        /// The wire frame
        frame: Frame,
    },

    /// A synthetic marker for sequence numbers that never materialized
    /// (crash between allocation and apply); never persisted
    Gap {
        /// First missing sequence, inclusive
        from: u64,
        /// Last missing sequence, inclusive
        to: u64,
    },
}

/// The firehose: hands out independent per-subscriber pumps
pub struct Firehose<S> {
    storage: Arc<S>,
    config: FirehoseConfig,
}

impl<S: RepoStorage + Send + Sync + 'static> Firehose<S> {
    /// Create a firehose over a storage back-end
    pub fn new(storage: Arc<S>, config: FirehoseConfig) -> Self {
        Self { storage, config }
    }

    /// Subscribe from a cursor, or live-tail when `cursor` is `None`
    ///
    /// The first delivered event is `cursor + 1`. A cursor older than
    /// `last_seq - rollback_window` fails with `OutdatedCursor`; the
    /// subscriber must resync via a full CAR export. A cursor ahead of
    /// `last_seq` is clamped to it.
    pub async fn subscribe(&self, cursor: Option<u64>) -> Result<Subscriber> {
        let last = self.storage.last_seq().await?;

        let start = match cursor {
            None => last,
            Some(c) => {
                if let Some(window) = self.config.rollback_window {
                    let earliest = last.saturating_sub(window);
                    if c < earliest {
                        return Err(RepoError::outdated_cursor(c, earliest));
                    }
                }
                c.min(last)
            }
        };

        tracing::debug!(cursor = start, "firehose subscriber connected");

        let (tx, rx) = mpsc::channel(256);
        let storage = self.storage.clone();
        let config = self.config.clone();
        let handle = tokio::spawn(async move {
            pump(storage, config, start, tx).await;
        });

        Ok(Subscriber { rx, handle })
    }
}

/// One subscriber's end of the firehose
///
/// Dropping it cancels the pump and releases its resources.
#[derive(Debug)]
pub struct Subscriber {
    rx: mpsc::Receiver<FirehoseItem>,
    handle: JoinHandle<()>,
}

impl Subscriber {
    /// Next item, or `None` once the pump has shut down
    pub async fn next(&mut self) -> Option<FirehoseItem> {
        self.rx.recv().await
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Per-subscriber pump loop
///
/// Reads the event log from `cursor + 1`, serializes each event, and writes
/// it to the subscriber channel. Skipped sequence numbers get a grace period
/// of [`GAP_TIMEOUT`] (the writer may be mid-commit) before a gap marker is
/// emitted and the cursor moves past them.
async fn pump<S: RepoStorage + Send + Sync + 'static>(
    storage: Arc<S>,
    config: FirehoseConfig,
    mut cursor: u64,
    tx: mpsc::Sender<FirehoseItem>,
) {
    let notify = storage.events_notify();
    let mut failures: u32 = 0;
    // set while waiting out a skipped sequence
    let mut gap_deadline: Option<Instant> = None;

    loop {
        // register interest before reading so a concurrent append cannot
        // slip between the read and the wait
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let batch = match storage.read_events_by_seq(cursor + 1, None).await {
            Ok(batch) => {
                failures = 0;
                batch
            }
            Err(err) => {
                failures += 1;
                if failures >= MAX_STORAGE_FAILURES {
                    tracing::error!(%err, failures, "storage failing; disconnecting subscriber");
                    return;
                }
                tracing::warn!(%err, "transient storage error in firehose pump");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let Some(first) = batch.first() else {
            gap_deadline = None;
            let _ = timeout(IDLE_POLL, notified).await;
            continue;
        };

        if first.seq > cursor + 1 {
            // a sequence number was skipped; give its writer time to land
            let deadline = *gap_deadline.get_or_insert_with(|| Instant::now() + GAP_TIMEOUT);
            let now = Instant::now();

            if now < deadline {
                tracing::debug!(missing = cursor + 1, "waiting for skipped seq");
                let _ = timeout(deadline - now, notified).await;
                continue; // re-query; the missing event may have landed
            }

            let to = first.seq - 1;
            tracing::warn!(from = cursor + 1, to, "gave up waiting for skipped seqs");
            if tx
                .send(FirehoseItem::Gap {
                    from: cursor + 1,
                    to,
                })
                .await
                .is_err()
            {
                return;
            }
            cursor = to;
        }
        gap_deadline = None;

        for event in batch {
            if event.seq != cursor + 1 {
                // interior skip; handled as a fresh gap on the next query
                break;
            }

            let item = match event.to_frame() {
                Ok(frame) => FirehoseItem::Frame {
                    seq: event.seq,
                    frame,
                },
                Err(err) => {
                    tracing::error!(%err, seq = event.seq, "failed to serialize event");
                    cursor = event.seq;
                    continue;
                }
            };

            if tx.send(item).await.is_err() {
                // subscriber went away; cooperative shutdown
                tracing::debug!(cursor, "firehose subscriber disconnected");
                return;
            }
            cursor = event.seq;
        }

        if !config.batch_delay.is_zero() {
            tokio::time::sleep(config.batch_delay).await;
        }
    }
}
