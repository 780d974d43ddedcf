//! FIFO backfill over the whole catalog: feed episodes through the engine at
//! its concurrency bound without ever evicting interactive work.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use super::{ExitKind, TranscodeEngine, TranscodeMetadata, TranscodeMode, TranscodeState};

const IDLE_WAIT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct BackfillItem {
    pub episode_id: i64,
    pub upstream_url: String,
    pub metadata: TranscodeMetadata,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct BackfillReport {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Drives bulk transcoding. On-demand starts stay possible while a run is in
/// flight; a bulk job evicted by one counts as failed and is not re-queued,
/// so a hot cache cannot livelock the run.
pub struct BulkBackfill {
    engine: Arc<TranscodeEngine>,
}

impl BulkBackfill {
    pub fn new(engine: Arc<TranscodeEngine>) -> Self {
        Self { engine }
    }

    pub async fn run(&self, episodes: Vec<BackfillItem>) -> BackfillReport {
        let mut report = BackfillReport {
            total: episodes.len(),
            ..BackfillReport::default()
        };
        let mut exits = self.engine.subscribe_exits();

        let mut queue: VecDeque<BackfillItem> = VecDeque::new();
        for item in episodes {
            if self.engine.state_of(item.episode_id) == Some(TranscodeState::Complete) {
                report.skipped += 1;
            } else {
                queue.push_back(item);
            }
        }
        info!(
            total = report.total,
            queued = queue.len(),
            skipped = report.skipped,
            "bulk backfill starting"
        );

        let mut in_flight: HashSet<i64> = HashSet::new();
        while !queue.is_empty() || !in_flight.is_empty() {
            while let Ok(exit) = exits.try_recv() {
                if in_flight.remove(&exit.episode_id) {
                    match exit.kind {
                        ExitKind::Completed => report.completed += 1,
                        ExitKind::Failed | ExitKind::Evicted => report.failed += 1,
                    }
                }
            }

            if self.engine.active_count() < self.engine.settings().max_concurrent {
                if let Some(item) = queue.pop_front() {
                    match self
                        .engine
                        .start(
                            item.episode_id,
                            &item.upstream_url,
                            TranscodeMode::Bulk,
                            item.metadata.clone(),
                        )
                        .await
                    {
                        Ok(_) => match self.engine.state_of(item.episode_id) {
                            Some(TranscodeState::Transcoding) => {
                                in_flight.insert(item.episode_id);
                            }
                            Some(TranscodeState::Complete) => report.completed += 1,
                            // Deferred by a capacity race; try again later.
                            _ => queue.push_back(item),
                        },
                        Err(err) => {
                            warn!(episode_id = item.episode_id, error = %err, "bulk start failed");
                            report.failed += 1;
                        }
                    }
                    continue;
                }
            }

            if !in_flight.is_empty() {
                match timeout(Duration::from_secs(60), exits.recv()).await {
                    Ok(Some(exit)) => {
                        if in_flight.remove(&exit.episode_id) {
                            match exit.kind {
                                ExitKind::Completed => report.completed += 1,
                                ExitKind::Failed | ExitKind::Evicted => report.failed += 1,
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        // Periodic re-check guards against a lost exit event.
                        let mut settled = Vec::new();
                        for id in in_flight.iter().copied() {
                            match self.engine.state_of(id) {
                                Some(TranscodeState::Complete) => {
                                    settled.push((id, true));
                                }
                                Some(TranscodeState::Transcoding) => {}
                                _ => settled.push((id, false)),
                            }
                        }
                        for (id, completed) in settled {
                            in_flight.remove(&id);
                            if completed {
                                report.completed += 1;
                            } else {
                                report.failed += 1;
                            }
                        }
                    }
                }
            } else if !queue.is_empty() {
                sleep(IDLE_WAIT).await;
            }
        }

        info!(
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            "bulk backfill finished"
        );
        report
    }
}
