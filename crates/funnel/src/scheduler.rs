//! Periodic sweep: select the due set, dispatch every pair with bounded
//! parallelism, and advance enrollments whose dispatch succeeded.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use funnel_channels::DispatchGateway;
use funnel_core::clock::Clock;
use funnel_core::config::SchedulerConfig;
use funnel_core::error::FunnelResult;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::selector::{DuePair, DueSetSelector};
use crate::tracker::EnrollmentTracker;
use crate::types::EnrollmentStatus;

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub due: usize,
    pub dispatched: usize,
    pub failed: usize,
    /// Pairs whose enrollment moved between selection and advance.
    pub conflicts: usize,
    /// Pairs skipped because another sweep held the enrollment's lock.
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairOutcome {
    Dispatched,
    Failed,
    Conflict,
    Skipped,
}

#[derive(Clone)]
pub struct Scheduler {
    selector: Arc<DueSetSelector>,
    tracker: Arc<EnrollmentTracker>,
    gateway: Arc<DispatchGateway>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("sweep_interval_secs", &self.config.sweep_interval_secs)
            .field("max_concurrent_dispatches", &self.config.max_concurrent_dispatches)
            .finish()
    }
}

impl Scheduler {
    pub fn new(
        selector: Arc<DueSetSelector>,
        tracker: Arc<EnrollmentTracker>,
        gateway: Arc<DispatchGateway>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_dispatches.max(1)));
        Self {
            selector,
            tracker,
            gateway,
            clock,
            config,
            permits,
        }
    }

    /// Run one sweep to completion. Every due pair is attempted exactly once;
    /// a failed pair stays due and is retried by the next sweep.
    pub async fn sweep(&self) -> SweepReport {
        let started = Instant::now();
        let now = self.clock.now();
        let due = self.selector.due_now(now);
        let mut report = SweepReport {
            due: due.len(),
            ..Default::default()
        };
        metrics::counter!("funnel.sweep.due").increment(due.len() as u64);

        let mut tasks = JoinSet::new();
        for pair in due {
            let this = self.clone();
            tasks.spawn(async move { this.process(pair).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(PairOutcome::Dispatched) => report.dispatched += 1,
                Ok(PairOutcome::Failed) => report.failed += 1,
                Ok(PairOutcome::Conflict) => report.conflicts += 1,
                Ok(PairOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    error!(error = %e, "Dispatch task panicked");
                    report.failed += 1;
                }
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        metrics::histogram!("funnel.sweep.duration_ms").record(elapsed_ms as f64);
        if report.due > 0 {
            info!(
                at = %now,
                due = report.due,
                dispatched = report.dispatched,
                failed = report.failed,
                conflicts = report.conflicts,
                skipped = report.skipped,
                elapsed_ms,
                "Sweep finished"
            );
        } else {
            debug!(at = %now, "Sweep found nothing due");
        }
        report
    }

    async fn process(&self, pair: DuePair) -> PairOutcome {
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return PairOutcome::Skipped;
        };

        let key = pair.enrollment.key();
        let lock = self.tracker.lock_for(&key);
        let Ok(_guard) = lock.try_lock() else {
            debug!(enrollment = %key, "Enrollment busy, leaving it to the holder");
            return PairOutcome::Skipped;
        };

        // The enrollment may have moved since the due set was selected.
        let still_due = self.tracker.get(&key).is_some_and(|current| {
            current.is_active()
                && current.generation == pair.enrollment.generation
                && current.current_stage_index == pair.enrollment.current_stage_index
        });
        if !still_due {
            debug!(enrollment = %key, stage = pair.stage.number, "Pair went stale before dispatch");
            return PairOutcome::Conflict;
        }

        match self.gateway.dispatch(&pair.job()).await {
            Ok(_) => match self.advance(&pair) {
                Ok(_) => PairOutcome::Dispatched,
                Err(e) => {
                    warn!(
                        enrollment = %key,
                        stage = pair.stage.number,
                        error = %e,
                        "Stage sent but enrollment changed underneath; advance discarded"
                    );
                    PairOutcome::Conflict
                }
            },
            Err(_) => {
                self.tracker.record_failure(pair.campaign.id);
                PairOutcome::Failed
            }
        }
    }

    /// Record the sent stage against the campaign as it is stored now; it may
    /// have been edited while the dispatch was in flight.
    fn advance(&self, pair: &DuePair) -> FunnelResult<EnrollmentStatus> {
        let current = self.selector.campaign(&pair.campaign.id);
        let campaign = current.as_ref().unwrap_or(pair.campaign.as_ref());
        self.tracker.advance(&pair.claim(), campaign, self.clock.now())
    }

    /// Sweep on a fixed interval until `shutdown` resolves. A sweep in
    /// progress is allowed to finish; sweeps never overlap.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(interval_secs = period.as_secs(), "Scheduler started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CampaignStore;
    use crate::time::TimeCalculator;
    use crate::types::{Campaign, EnrollmentKey, Stage};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use funnel_channels::{DeliveryReceipt, DispatchError, OutboundMessage, SendCapability};
    use funnel_core::clock::ManualClock;
    use funnel_core::types::{Channel, CustomerProfile};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl SendCapability for Counting {
        async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, DispatchError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(DeliveryReceipt {
                provider_message_id: "m".into(),
                channel: message.channel,
                recipient: message.recipient.clone(),
                accepted_at: Utc::now(),
            })
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    fn build() -> (Scheduler, Arc<EnrollmentTracker>, Arc<Counting>, Campaign) {
        let store = Arc::new(CampaignStore::new());
        let tracker = Arc::new(EnrollmentTracker::new(TimeCalculator::utc()));
        let campaign = Campaign::new("p-1", "drip", Channel::Sms)
            .with_stage(Stage::new(1, 0, "hi {{customer_name}}"))
            .with_stage(Stage::new(2, 2, "again"));
        store.create(campaign.clone()).unwrap();
        tracker.enroll_or_reenter(
            &campaign,
            &CustomerProfile::new("c-1", "Kim").with_phone("010-1234-5678"),
            t0(),
        );

        let transport = Arc::new(Counting {
            sent: AtomicUsize::new(0),
        });
        let gateway = Arc::new(DispatchGateway::new(
            transport.clone(),
            Duration::from_secs(1),
            "Partner",
        ));
        let scheduler = Scheduler::new(
            Arc::new(DueSetSelector::new(store, tracker.clone())),
            tracker.clone(),
            gateway,
            Arc::new(ManualClock::new(t0())),
            SchedulerConfig::default(),
        );
        (scheduler, tracker, transport, campaign)
    }

    #[tokio::test]
    async fn test_sweep_sends_and_advances() {
        let (scheduler, tracker, transport, campaign) = build();
        let report = scheduler.sweep().await;
        assert_eq!(report.due, 1);
        assert_eq!(report.dispatched, 1);
        assert_eq!(transport.sent.load(Ordering::SeqCst), 1);

        let e = tracker.get(&EnrollmentKey::new("c-1", campaign.id)).unwrap();
        assert_eq!(e.current_stage_index, 1);

        // Same instant again: stage 2 is not due until day 2.
        assert_eq!(scheduler.sweep().await, SweepReport::default());
    }

    #[tokio::test]
    async fn test_locked_enrollment_is_skipped() {
        let (scheduler, tracker, transport, campaign) = build();
        let lock = tracker.lock_for(&EnrollmentKey::new("c-1", campaign.id));
        let _held = lock.lock().await;

        let report = scheduler.sweep().await;
        assert_eq!(report.skipped, 1);
        assert_eq!(transport.sent.load(Ordering::SeqCst), 0);
    }

    /// Adds a stage to the campaign while the first message is being sent.
    struct EditingDuringSend {
        store: Arc<CampaignStore>,
        tracker: Arc<EnrollmentTracker>,
        edit: parking_lot::Mutex<Option<Campaign>>,
        sent: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SendCapability for EditingDuringSend {
        async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, DispatchError> {
            if let Some(edited) = self.edit.lock().take() {
                let stored = self.store.update(edited).unwrap();
                self.tracker.reconcile_campaign(&stored);
            }
            self.sent.lock().push(message.body.clone());
            Ok(DeliveryReceipt {
                provider_message_id: "m".into(),
                channel: message.channel,
                recipient: message.recipient.clone(),
                accepted_at: Utc::now(),
            })
        }
    }

    #[tokio::test]
    async fn test_edit_while_sending_does_not_stall_enrollment() {
        let store = Arc::new(CampaignStore::new());
        let tracker = Arc::new(EnrollmentTracker::new(TimeCalculator::utc()));
        let campaign = Campaign::new("p-1", "drip", Channel::Sms)
            .with_stage(Stage::new(1, 0, "welcome"))
            .with_stage(Stage::new(3, 5, "day five"));
        store.create(campaign.clone()).unwrap();
        tracker.enroll_or_reenter(
            &campaign,
            &CustomerProfile::new("c-1", "Kim").with_phone("010-1234-5678"),
            t0(),
        );
        let mut edited = campaign.clone();
        edited.stages.push(Stage::new(0, 0, "early").at(0, 0));

        let transport = Arc::new(EditingDuringSend {
            store: store.clone(),
            tracker: tracker.clone(),
            edit: parking_lot::Mutex::new(Some(edited)),
            sent: parking_lot::Mutex::new(Vec::new()),
        });
        let gateway = Arc::new(DispatchGateway::new(
            transport.clone(),
            Duration::from_secs(1),
            "Partner",
        ));
        let clock = Arc::new(ManualClock::new(t0()));
        let scheduler = Scheduler::new(
            Arc::new(DueSetSelector::new(store, tracker.clone())),
            tracker.clone(),
            gateway,
            clock.clone(),
            SchedulerConfig::default(),
        );

        assert_eq!(scheduler.sweep().await.dispatched, 1);
        clock.set(t0() + chrono::Duration::days(5));
        assert_eq!(scheduler.sweep().await.dispatched, 1);

        let e = tracker.get(&EnrollmentKey::new("c-1", campaign.id)).unwrap();
        assert_eq!(e.status, EnrollmentStatus::Completed);
        assert_eq!(*transport.sent.lock(), vec!["welcome", "day five"]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (scheduler, _, transport, _) = build();
        // An already-resolved shutdown may still race the first tick.
        scheduler.run(async {}).await;
        assert!(transport.sent.load(Ordering::SeqCst) <= 1);
    }
}
