//! Throttled progress publication.

use data_types::{ProgressUpdate, QueryId};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use stratus_time::{Time, TimeProvider};
use tokio::sync::broadcast;

/// Minimum spacing between two non-terminal updates for one stage.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Fan-out point for progress updates produced by stage executions on this
/// worker. `StreamProgress` subscribers receive every published update for
/// their query; publication of non-terminal updates is throttled to one per
/// second per (query, stage).
#[derive(Debug)]
pub struct ProgressHub {
    sender: broadcast::Sender<ProgressUpdate>,
    last_published: Mutex<HashMap<(QueryId, u64), Time>>,
    time_provider: Arc<dyn TimeProvider>,
}

impl ProgressHub {
    pub fn new(time_provider: Arc<dyn TimeProvider>) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            sender,
            last_published: Mutex::new(HashMap::new()),
            time_provider,
        }
    }

    /// Publish an update. Returns `true` if it was forwarded, `false` if
    /// throttled. Terminal updates are never throttled and clear the
    /// throttle slot.
    pub fn publish(&self, update: ProgressUpdate) -> bool {
        let key = (update.query_id.clone(), update.stage_id);
        let now = self.time_provider.now();

        if update.status.is_terminal() {
            self.last_published.lock().remove(&key);
        } else {
            let mut last = self.last_published.lock();
            if let Some(previous) = last.get(&key) {
                let elapsed = now.checked_duration_since(*previous).unwrap_or_default();
                if elapsed < PROGRESS_INTERVAL {
                    return false;
                }
            }
            last.insert(key, now);
        }

        // send only fails when nobody subscribes, which is fine
        self.sender.send(update).is_ok()
    }

    /// Subscribe to all future updates; callers filter by query.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{StageStats, StageStatus, WorkerId};
    use stratus_time::MockProvider;

    fn update(status: StageStatus, percent: f64) -> ProgressUpdate {
        ProgressUpdate {
            query_id: QueryId::new("q-1"),
            stage_id: 1,
            worker_id: WorkerId::new("w-1"),
            status,
            percent,
            stats: StageStats::default(),
            trace_id: String::new(),
        }
    }

    #[tokio::test]
    async fn throttles_to_one_per_second() {
        let clock = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let hub = ProgressHub::new(Arc::clone(&clock) as _);
        let mut rx = hub.subscribe();

        assert!(hub.publish(update(StageStatus::Running, 0.1)));
        assert!(!hub.publish(update(StageStatus::Running, 0.2)));

        clock.inc(Duration::from_millis(1500));
        assert!(hub.publish(update(StageStatus::Running, 0.3)));

        assert_eq!(rx.recv().await.unwrap().percent, 0.1);
        assert_eq!(rx.recv().await.unwrap().percent, 0.3);
    }

    #[tokio::test]
    async fn terminal_updates_bypass_the_throttle() {
        let clock = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let hub = ProgressHub::new(Arc::clone(&clock) as _);
        let mut rx = hub.subscribe();

        assert!(hub.publish(update(StageStatus::Running, 0.5)));
        assert!(hub.publish(update(StageStatus::Succeeded, 1.0)));

        assert_eq!(rx.recv().await.unwrap().percent, 0.5);
        let terminal = rx.recv().await.unwrap();
        assert_eq!(terminal.status, StageStatus::Succeeded);
    }

    #[test]
    fn publish_without_subscribers_is_throttled_bookkeeping_only() {
        let clock = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let hub = ProgressHub::new(clock as _);

        // no subscriber: send fails, but throttling still applies
        assert!(!hub.publish(update(StageStatus::Running, 0.1)));
        assert!(!hub.publish(update(StageStatus::Running, 0.2)));
    }
}
