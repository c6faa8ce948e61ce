//! Enrollment tracker. Owns every customer's progress through every
//! campaign: creation on entry, re-entry policy resolution, the
//! conditional advance after a successful dispatch, pause/resume, and
//! completion.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use funnel_core::error::{FunnelError, FunnelResult};
use funnel_core::event_bus::{make_event, EventSink};
use funnel_core::types::{CustomerProfile, EventType};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::state_machine::EnrollmentStateMachine;
use crate::time::{ScheduledStage, TimeCalculator};
use crate::types::{
    Campaign, CampaignStats, Enrollment, EnrollmentKey, EnrollmentStatus, EntryOutcome,
    ReEntryPolicy,
};

/// Identifies exactly which stage of which run an advance is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageClaim {
    pub key: EnrollmentKey,
    pub generation: u64,
    pub stage_number: u32,
}

#[derive(Debug, Default, Clone, Copy)]
struct DispatchCounters {
    dispatched: u64,
    failed: u64,
}

pub struct EnrollmentTracker {
    enrollments: DashMap<EnrollmentKey, Enrollment>,
    /// Per-enrollment dispatch locks, held for one dispatch+advance only.
    locks: DashMap<EnrollmentKey, Arc<Mutex<()>>>,
    counters: DashMap<Uuid, DispatchCounters>,
    time: TimeCalculator,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for EnrollmentTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrollmentTracker")
            .field("enrollments", &self.enrollments.len())
            .field("timezone", &self.time.timezone())
            .finish()
    }
}

/// Move the pointer past stages that were already sent. Returns true when
/// the pointer has run off the end of a non-empty sequence.
fn skip_sent(time: &TimeCalculator, enrollment: &mut Enrollment, campaign: &Campaign) -> bool {
    let schedule = time.schedule(enrollment.anchor_at, &campaign.stages);
    while let Some(scheduled) = schedule.get(enrollment.current_stage_index) {
        if !enrollment.sent_stage_numbers.contains(&scheduled.stage.number) {
            break;
        }
        enrollment.current_stage_index += 1;
    }
    !schedule.is_empty() && enrollment.current_stage_index >= schedule.len()
}

/// The first stage at or after the pointer that has not been sent yet.
/// A campaign edit can leave the pointer on a sent stage until the next
/// advance or reconcile moves it, so readers scan forward instead of
/// trusting the index alone.
pub fn pending_stage<'a>(
    time: &TimeCalculator,
    enrollment: &Enrollment,
    campaign: &'a Campaign,
) -> Option<ScheduledStage<'a>> {
    time.schedule(enrollment.anchor_at, &campaign.stages)
        .into_iter()
        .skip(enrollment.current_stage_index)
        .find(|s| !enrollment.sent_stage_numbers.contains(&s.stage.number))
}

impl EnrollmentTracker {
    pub fn new(time: TimeCalculator) -> Self {
        Self {
            enrollments: DashMap::new(),
            locks: DashMap::new(),
            counters: DashMap::new(),
            time,
            event_sink: funnel_core::event_bus::noop_sink(),
        }
    }

    /// Attach an event sink for emitting enrollment events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn time(&self) -> &TimeCalculator {
        &self.time
    }

    /// Apply an entry event for a targeted campaign: create the enrollment
    /// on first entry, otherwise resolve the campaign's re-entry policy
    /// against the existing one.
    pub fn enroll_or_reenter(
        &self,
        campaign: &Campaign,
        profile: &CustomerProfile,
        at: DateTime<Utc>,
    ) -> EntryOutcome {
        let key = EnrollmentKey::new(&profile.customer_id, campaign.id);
        let outcome = match self.enrollments.entry(key) {
            Entry::Vacant(vacant) => {
                vacant.insert(Enrollment::new(campaign.id, profile.clone(), at));
                EntryOutcome::Enrolled
            }
            Entry::Occupied(mut occupied) => Self::apply_reentry(
                occupied.get_mut(),
                campaign.re_entry_policy,
                profile,
                at,
            ),
        };
        self.announce(campaign.id, &profile.customer_id, outcome, campaign.re_entry_policy);
        outcome
    }

    /// Apply an entry event for a partner-wide campaign: only the first
    /// entry into any of the partner's groups enrolls.
    pub fn ensure_enrolled(
        &self,
        campaign: &Campaign,
        profile: &CustomerProfile,
        at: DateTime<Utc>,
    ) -> EntryOutcome {
        let key = EnrollmentKey::new(&profile.customer_id, campaign.id);
        let outcome = match self.enrollments.entry(key) {
            Entry::Vacant(vacant) => {
                vacant.insert(Enrollment::new(campaign.id, profile.clone(), at));
                EntryOutcome::Enrolled
            }
            Entry::Occupied(_) => EntryOutcome::Unchanged,
        };
        self.announce(campaign.id, &profile.customer_id, outcome, campaign.re_entry_policy);
        outcome
    }

    fn apply_reentry(
        enrollment: &mut Enrollment,
        policy: ReEntryPolicy,
        profile: &CustomerProfile,
        at: DateTime<Utc>,
    ) -> EntryOutcome {
        if !policy.refreshes_profile() {
            return EntryOutcome::Unchanged;
        }
        enrollment.profile = profile.clone();
        enrollment.updated_at = at;
        if !policy.resets_timing() {
            return EntryOutcome::ProfileRefreshed;
        }
        enrollment.anchor_at = at;
        enrollment.current_stage_index = 0;
        enrollment.sent_stage_numbers.clear();
        enrollment.status = EnrollmentStatus::Active;
        enrollment.generation += 1;
        EntryOutcome::Restarted
    }

    fn announce(&self, campaign_id: Uuid, customer_id: &str, outcome: EntryOutcome, policy: ReEntryPolicy) {
        let event_type = match outcome {
            EntryOutcome::Enrolled => {
                info!(campaign_id = %campaign_id, customer_id = %customer_id, "Customer enrolled");
                EventType::EnrollmentCreated
            }
            EntryOutcome::Restarted => {
                info!(
                    campaign_id = %campaign_id,
                    customer_id = %customer_id,
                    policy = %policy,
                    "Re-entry restarted enrollment"
                );
                EventType::EnrollmentReset
            }
            EntryOutcome::ProfileRefreshed | EntryOutcome::Unchanged => {
                debug!(
                    campaign_id = %campaign_id,
                    customer_id = %customer_id,
                    policy = %policy,
                    outcome = ?outcome,
                    "Re-entry kept enrollment timing"
                );
                return;
            }
        };
        self.event_sink
            .emit(make_event(event_type, Some(campaign_id), Some(customer_id), None));
    }

    /// Record a successful dispatch of the claimed stage and move past it.
    /// `campaign` should be the campaign as currently stored: the claimed
    /// stage is located in its present ordering, so an edit made while the
    /// dispatch was in flight cannot strand the pointer on a sent stage.
    /// A claim from an earlier run, for a completed enrollment, or for a
    /// stage already recorded gets `ConcurrencyConflict`.
    pub fn advance(
        &self,
        claim: &StageClaim,
        campaign: &Campaign,
        at: DateTime<Utc>,
    ) -> FunnelResult<EnrollmentStatus> {
        let conflict = |why: &str| {
            FunnelError::ConcurrencyConflict(format!(
                "{} stage {}: {}",
                claim.key, claim.stage_number, why
            ))
        };

        let status = {
            let mut entry = self
                .enrollments
                .get_mut(&claim.key)
                .ok_or_else(|| FunnelError::not_found(format!("enrollment {}", claim.key)))?;
            let enrollment = entry.value_mut();

            if enrollment.generation != claim.generation {
                return Err(conflict("enrollment restarted"));
            }
            if enrollment.status == EnrollmentStatus::Completed {
                return Err(conflict("enrollment already completed"));
            }
            if enrollment.sent_stage_numbers.contains(&claim.stage_number) {
                return Err(conflict("stage already sent"));
            }

            let position = self
                .time
                .schedule(enrollment.anchor_at, &campaign.stages)
                .iter()
                .position(|s| s.stage.number == claim.stage_number);
            enrollment.sent_stage_numbers.insert(claim.stage_number);
            match position {
                Some(index) => {
                    enrollment.current_stage_index = enrollment.current_stage_index.max(index + 1);
                }
                None => debug!(
                    enrollment = %claim.key,
                    stage = claim.stage_number,
                    "Sent stage no longer in campaign"
                ),
            }
            enrollment.updated_at = at;
            if skip_sent(&self.time, enrollment, campaign) {
                let mut sm = EnrollmentStateMachine::new(enrollment.status);
                sm.transition(EnrollmentStatus::Completed)?;
                enrollment.status = sm.state;
            }
            enrollment.status
        };

        self.counters
            .entry(claim.key.campaign_id)
            .or_default()
            .dispatched += 1;

        if status == EnrollmentStatus::Completed {
            info!(
                campaign_id = %claim.key.campaign_id,
                customer_id = %claim.key.customer_id,
                "Enrollment completed"
            );
            self.event_sink.emit(make_event(
                EventType::EnrollmentCompleted,
                Some(claim.key.campaign_id),
                Some(&claim.key.customer_id),
                Some(claim.stage_number),
            ));
        }
        Ok(status)
    }

    /// Count a failed dispatch. The enrollment itself is left untouched.
    pub fn record_failure(&self, campaign_id: Uuid) {
        self.counters.entry(campaign_id).or_default().failed += 1;
    }

    pub fn pause(&self, key: &EnrollmentKey, at: DateTime<Utc>) -> FunnelResult<()> {
        self.set_status(key, EnrollmentStatus::Paused, EventType::EnrollmentPaused, at)
    }

    /// Resume keeps the anchor and pointer, so anything that came due while
    /// paused fires on the next sweep.
    pub fn resume(&self, key: &EnrollmentKey, at: DateTime<Utc>) -> FunnelResult<()> {
        self.set_status(key, EnrollmentStatus::Active, EventType::EnrollmentResumed, at)
    }

    fn set_status(
        &self,
        key: &EnrollmentKey,
        to: EnrollmentStatus,
        event_type: EventType,
        at: DateTime<Utc>,
    ) -> FunnelResult<()> {
        {
            let mut entry = self
                .enrollments
                .get_mut(key)
                .ok_or_else(|| FunnelError::not_found(format!("enrollment {}", key)))?;
            if entry.status == EnrollmentStatus::Completed {
                return Err(FunnelError::validation(format!(
                    "enrollment {} is completed; only re-entry can restart it",
                    key
                )));
            }
            let mut sm = EnrollmentStateMachine::new(entry.status);
            let trigger = sm.transition(to)?;
            entry.status = sm.state;
            entry.updated_at = at;
            info!(enrollment = %key, trigger, "Enrollment status changed");
        }
        self.event_sink.emit(make_event(
            event_type,
            Some(key.campaign_id),
            Some(&key.customer_id),
            None,
        ));
        Ok(())
    }

    /// Re-align every enrollment of an edited campaign with its current stage
    /// ordering. Returns how many enrollments completed as a result.
    pub fn reconcile_campaign(&self, campaign: &Campaign) -> usize {
        let mut completed = 0;
        for mut entry in self.enrollments.iter_mut() {
            if entry.campaign_id != campaign.id || entry.status == EnrollmentStatus::Completed {
                continue;
            }
            let enrollment = entry.value_mut();
            if !skip_sent(&self.time, enrollment, campaign) {
                continue;
            }
            let mut sm = EnrollmentStateMachine::new(enrollment.status);
            match sm.transition(EnrollmentStatus::Completed) {
                Ok(_) => {
                    enrollment.status = sm.state;
                    completed += 1;
                }
                Err(e) => warn!(
                    enrollment = %enrollment.key(),
                    error = %e,
                    "Edited campaign left enrollment with nothing to send"
                ),
            }
        }
        if completed > 0 {
            warn!(
                campaign_id = %campaign.id,
                completed,
                "Campaign edit completed enrollments that had received every remaining stage"
            );
        }
        completed
    }

    pub fn get(&self, key: &EnrollmentKey) -> Option<Enrollment> {
        self.enrollments.get(key).map(|e| e.clone())
    }

    /// Every ACTIVE enrollment, cloned.
    pub fn snapshot_active(&self) -> Vec<Enrollment> {
        self.enrollments
            .iter()
            .filter(|e| e.is_active())
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn list_for_campaign(&self, campaign_id: &Uuid) -> Vec<Enrollment> {
        self.enrollments
            .iter()
            .filter(|e| e.campaign_id == *campaign_id)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn remove(&self, key: &EnrollmentKey) -> Option<Enrollment> {
        self.locks.remove(key);
        self.enrollments.remove(key).map(|(_, e)| e)
    }

    /// Discard every enrollment of a deleted campaign.
    pub fn remove_for_campaign(&self, campaign_id: &Uuid) -> usize {
        let before = self.enrollments.len();
        self.enrollments.retain(|k, _| k.campaign_id != *campaign_id);
        self.locks.retain(|k, _| k.campaign_id != *campaign_id);
        self.counters.remove(campaign_id);
        before.saturating_sub(self.enrollments.len())
    }

    /// The dispatch lock for one enrollment.
    pub fn lock_for(&self, key: &EnrollmentKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn stats(&self, campaign_id: &Uuid) -> CampaignStats {
        let mut stats = CampaignStats {
            campaign_id: *campaign_id,
            ..Default::default()
        };
        for entry in self.enrollments.iter() {
            if entry.campaign_id != *campaign_id {
                continue;
            }
            stats.enrolled += 1;
            match entry.status {
                EnrollmentStatus::Active => stats.active += 1,
                EnrollmentStatus::Paused => stats.paused += 1,
                EnrollmentStatus::Completed => stats.completed += 1,
            }
        }
        if let Some(counters) = self.counters.get(campaign_id) {
            stats.dispatched = counters.dispatched;
            stats.failed = counters.failed;
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.enrollments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.enrollments.is_empty()
    }
}
