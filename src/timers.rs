use std::sync::{Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::trace;

/// Implemented by connections so the shared scheduler can drive their idle, ack-wait and
///  severe-alert checks without owning them.
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait TimeoutTarget: Send + Sync + 'static {
    fn is_stopped(&self) -> bool;

    async fn check_timeouts(&self, now: Instant);
}

/// One scheduler per transport endpoint. Connections register on creation and are dropped
///  from the roster automatically once nothing else keeps them alive; closing a connection
///  merely makes its checks no-ops until then.
pub struct TransportScheduler {
    targets: Mutex<Vec<Weak<dyn TimeoutTarget>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportScheduler {
    pub fn new(check_interval: Duration) -> std::sync::Arc<TransportScheduler> {
        let scheduler = std::sync::Arc::new(TransportScheduler {
            targets: Mutex::new(Vec::new()),
            task: Mutex::new(None),
        });

        let task = tokio::spawn(Self::run(std::sync::Arc::downgrade(&scheduler), check_interval));
        *scheduler.task.lock().unwrap() = Some(task);

        scheduler
    }

    pub(crate) fn register(&self, target: Weak<dyn TimeoutTarget>) {
        self.targets.lock().unwrap().push(target);
    }

    async fn run(scheduler: Weak<TransportScheduler>, check_interval: Duration) {
        let mut ticks = interval(check_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticks.tick().await;

            let Some(scheduler) = scheduler.upgrade() else {
                return;
            };

            let live = {
                let mut targets = scheduler.targets.lock().unwrap();
                targets.retain(|t| t.strong_count() > 0);
                targets.iter().filter_map(|t| t.upgrade()).collect::<Vec<_>>()
            };
            drop(scheduler);

            let now = Instant::now();
            for target in live {
                if !target.is_stopped() {
                    target.check_timeouts(now).await;
                }
            }
        }
    }
}

impl Drop for TransportScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

/// Implemented by connections that can take part in a transmission's ack group.
pub trait AckParticipant: Send + Sync + 'static {
    /// Push this connection's severe-alert deadline into the future.
    fn postpone_severe_alert(&self, by: Duration);
}

/// The set of peers participating in one transmission. When the severe-alert timer fires
///  for one of them, the others get their deadline bumped so a single slow transmission
///  does not flood the logs with one alert per peer.
pub struct AckConnectionGroup {
    members: Mutex<Vec<Weak<dyn AckParticipant>>>,
}

impl AckConnectionGroup {
    pub fn new() -> std::sync::Arc<AckConnectionGroup> {
        std::sync::Arc::new(AckConnectionGroup {
            members: Mutex::new(Vec::new()),
        })
    }

    pub fn add(&self, member: Weak<dyn AckParticipant>) {
        self.members.lock().unwrap().push(member);
    }

    pub fn postpone_others(&self, alerted: &Weak<dyn AckParticipant>, by: Duration) {
        let members = self.members.lock().unwrap();
        for member in members.iter() {
            if Weak::ptr_eq(member, alerted) {
                continue;
            }
            if let Some(member) = member.upgrade() {
                trace!("postponing severe-alert deadline of an ack-group peer by {:?}", by);
                member.postpone_severe_alert(by);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_drives_registered_targets() {
        let mut target = MockTimeoutTarget::new();
        target.expect_is_stopped().return_const(false);
        let calls = Arc::new(AtomicU64::new(0));
        {
            let calls = calls.clone();
            target.expect_check_timeouts().returning(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        let target: Arc<dyn TimeoutTarget> = Arc::new(target);

        let scheduler = TransportScheduler::new(Duration::from_millis(100));
        scheduler.register(Arc::downgrade(&target));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_skips_stopped_targets() {
        let mut target = MockTimeoutTarget::new();
        target.expect_is_stopped().return_const(true);
        target.expect_check_timeouts().never();
        let target: Arc<dyn TimeoutTarget> = Arc::new(target);

        let scheduler = TransportScheduler::new(Duration::from_millis(100));
        scheduler.register(Arc::downgrade(&target));

        tokio::time::sleep(Duration::from_millis(350)).await;
    }

    struct RecordingParticipant {
        postponed_millis: AtomicU64,
    }
    impl AckParticipant for RecordingParticipant {
        fn postpone_severe_alert(&self, by: Duration) {
            self.postponed_millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_ack_group_postpones_everyone_but_the_alerted() {
        let a = Arc::new(RecordingParticipant { postponed_millis: AtomicU64::new(0) });
        let b = Arc::new(RecordingParticipant { postponed_millis: AtomicU64::new(0) });
        let a_weak: Weak<dyn AckParticipant> = Arc::downgrade(&(a.clone() as Arc<dyn AckParticipant>));
        let b_weak: Weak<dyn AckParticipant> = Arc::downgrade(&(b.clone() as Arc<dyn AckParticipant>));

        let group = AckConnectionGroup::new();
        group.add(a_weak.clone());
        group.add(b_weak);

        group.postpone_others(&a_weak, Duration::from_millis(200));

        assert_eq!(a.postponed_millis.load(Ordering::SeqCst), 0);
        assert_eq!(b.postponed_millis.load(Ordering::SeqCst), 200);
    }
}
