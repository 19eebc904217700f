//! In-process fan-out of per-job status events to live observers.
//!
//! Strictly in-memory and per-process: observers that reconnect must
//! re-fetch current state from the store. Each subscription sits on a
//! bounded broadcast buffer; slow observers lose the oldest events and see
//! an explicit lag marker instead of blocking publishers.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::broadcast;
use tracing::trace;

use crate::domain::{ProgressEvent, Update};

/// Buffered events per subscription before the oldest are dropped.
const SUBSCRIPTION_BUFFER: usize = 64;

/// Publish/subscribe fabric for job progress events.
pub struct ProgressBus {
    channels: RwLock<HashMap<i64, broadcast::Sender<ProgressEvent>>>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to a job's event stream. Events published before the call
    /// are not replayed.
    pub fn subscribe(&self, job_id: i64) -> Subscription {
        let mut channels = self.channels.write().unwrap();
        let sender = channels
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(SUBSCRIPTION_BUFFER).0);
        Subscription {
            receiver: sender.subscribe(),
        }
    }

    /// Fire-and-forget publish. Events for jobs without subscribers are
    /// dropped; publishers never block.
    pub fn publish(&self, job_id: i64, event: ProgressEvent) {
        let stale = {
            let channels = self.channels.read().unwrap();
            match channels.get(&job_id) {
                Some(sender) => {
                    if sender.receiver_count() == 0 {
                        true
                    } else {
                        trace!(job_id, status = %event.status, "progress published");
                        let _ = sender.send(event);
                        false
                    }
                }
                None => return,
            }
        };
        // The last subscription is gone; drop the routing entry.
        if stale {
            let mut channels = self.channels.write().unwrap();
            if let Some(sender) = channels.get(&job_id) {
                if sender.receiver_count() == 0 {
                    channels.remove(&job_id);
                }
            }
        }
    }

    /// Number of jobs with at least one routing entry. Test aid.
    pub fn routed_jobs(&self) -> usize {
        self.channels.read().unwrap().len()
    }
}

/// A live view onto one job's event stream.
pub struct Subscription {
    receiver: broadcast::Receiver<ProgressEvent>,
}

impl Subscription {
    /// Wait for the next update. Returns `None` once the stream is closed
    /// and fully drained.
    pub async fn next(&mut self) -> Option<Update> {
        match self.receiver.recv().await {
            Ok(event) => Some(Update::Event(event)),
            Err(broadcast::error::RecvError::Lagged(missed)) => Some(Update::Lagged { missed }),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Non-blocking poll; `None` when no update is pending right now.
    pub fn try_next(&mut self) -> Option<Update> {
        match self.receiver.try_recv() {
            Ok(event) => Some(Update::Event(event)),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => Some(Update::Lagged { missed }),
            Err(_) => None,
        }
    }

    /// Stop observing. Equivalent to dropping the subscription.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobStatus;

    fn event(job_id: i64, pct: u8) -> ProgressEvent {
        ProgressEvent::milestone(job_id, JobStatus::Processing, pct)
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = ProgressBus::new();
        let mut sub = bus.subscribe(1);

        for pct in [0, 60, 80] {
            bus.publish(1, event(1, pct));
        }

        for expected in [0u8, 60, 80] {
            match sub.next().await.unwrap() {
                Update::Event(e) => assert_eq!(e.progress_pct, Some(expected)),
                other => panic!("unexpected update: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn publishes_to_unsubscribed_jobs_are_dropped() {
        let bus = ProgressBus::new();
        bus.publish(42, event(42, 0));
        assert_eq!(bus.routed_jobs(), 0);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_flags_the_gap() {
        let bus = ProgressBus::new();
        let mut sub = bus.subscribe(1);

        let total = SUBSCRIPTION_BUFFER + 10;
        for i in 0..total {
            bus.publish(1, event(1, (i % 100) as u8));
        }

        match sub.next().await.unwrap() {
            Update::Lagged { missed } => assert_eq!(missed, 10),
            other => panic!("expected lag marker, got {other:?}"),
        }
        // The stream continues after the gap with the oldest retained event.
        match sub.next().await.unwrap() {
            Update::Event(e) => assert_eq!(e.progress_pct, Some((10 % 100) as u8)),
            other => panic!("unexpected update: {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribers_only_see_their_job() {
        let bus = ProgressBus::new();
        let mut sub_a = bus.subscribe(1);
        let mut sub_b = bus.subscribe(2);

        bus.publish(1, event(1, 60));
        bus.publish(2, event(2, 80));

        match sub_a.next().await.unwrap() {
            Update::Event(e) => assert_eq!(e.job_id, 1),
            other => panic!("unexpected update: {other:?}"),
        }
        match sub_b.next().await.unwrap() {
            Update::Event(e) => assert_eq!(e.job_id, 2),
            other => panic!("unexpected update: {other:?}"),
        }
    }

    #[tokio::test]
    async fn closing_the_last_subscription_removes_routing() {
        let bus = ProgressBus::new();
        let sub = bus.subscribe(1);
        assert_eq!(bus.routed_jobs(), 1);

        sub.close();
        // Cleanup is lazy: the next publish notices and removes the entry.
        bus.publish(1, event(1, 0));
        assert_eq!(bus.routed_jobs(), 0);
    }
}
