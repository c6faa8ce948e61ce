//! Due-set selection: which (enrollment, stage) pairs should fire now.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use funnel_channels::DispatchJob;
use tracing::debug;
use uuid::Uuid;

use crate::store::CampaignStore;
use crate::time::TimeCalculator;
use crate::tracker::{pending_stage, EnrollmentTracker, StageClaim};
use crate::types::{Campaign, Enrollment, Stage};

/// One stage that is due for one enrollment, captured at selection time.
#[derive(Debug, Clone)]
pub struct DuePair {
    pub enrollment: Enrollment,
    pub campaign: Arc<Campaign>,
    pub stage: Stage,
    pub fire_at: DateTime<Utc>,
}

impl DuePair {
    pub fn claim(&self) -> StageClaim {
        StageClaim {
            key: self.enrollment.key(),
            generation: self.enrollment.generation,
            stage_number: self.stage.number,
        }
    }

    pub fn job(&self) -> DispatchJob {
        DispatchJob {
            campaign_id: self.campaign.id,
            stage_number: self.stage.number,
            channel: self.campaign.channel,
            title: self.stage.title.clone(),
            template: self.stage.content.clone(),
            sender: self.campaign.sender.clone(),
            compliance: self.campaign.compliance.clone(),
            profile: self.enrollment.profile.clone(),
        }
    }
}

pub struct DueSetSelector {
    store: Arc<CampaignStore>,
    tracker: Arc<EnrollmentTracker>,
}

impl DueSetSelector {
    pub fn new(store: Arc<CampaignStore>, tracker: Arc<EnrollmentTracker>) -> Self {
        Self { store, tracker }
    }

    /// The campaign as currently stored, which may differ from the copy a
    /// due pair captured at selection time.
    pub fn campaign(&self, id: &Uuid) -> Option<Campaign> {
        self.store.get(id)
    }

    /// The next unsent stage from the enrollment's pointer and its fire
    /// instant, whether or not it is due yet. `None` when nothing is left.
    pub fn current_stage<'a>(
        time: &TimeCalculator,
        enrollment: &Enrollment,
        campaign: &'a Campaign,
    ) -> Option<(&'a Stage, DateTime<Utc>)> {
        pending_stage(time, enrollment, campaign).map(|s| (s.stage, s.fire_at))
    }

    /// The stage that should fire for this enrollment at `at`, if any. At
    /// most one stage per enrollment is ever due.
    pub fn next_due<'a>(
        time: &TimeCalculator,
        enrollment: &Enrollment,
        campaign: &'a Campaign,
        at: DateTime<Utc>,
    ) -> Option<(&'a Stage, DateTime<Utc>)> {
        if !enrollment.is_active() || !campaign.active {
            return None;
        }
        Self::current_stage(time, enrollment, campaign).filter(|(_, fire_at)| *fire_at <= at)
    }

    /// Every due pair at `at`, oldest fire time first.
    pub fn due_now(&self, at: DateTime<Utc>) -> Vec<DuePair> {
        let campaigns: HashMap<Uuid, Arc<Campaign>> = self
            .store
            .list_active()
            .into_iter()
            .map(|c| (c.id, Arc::new(c)))
            .collect();
        let time = self.tracker.time();

        let mut due: Vec<DuePair> = self
            .tracker
            .snapshot_active()
            .into_iter()
            .filter_map(|enrollment| {
                let campaign = campaigns.get(&enrollment.campaign_id)?;
                let (stage, fire_at) = Self::next_due(time, &enrollment, campaign, at)?;
                let stage = stage.clone();
                Some(DuePair {
                    enrollment,
                    campaign: Arc::clone(campaign),
                    stage,
                    fire_at,
                })
            })
            .collect();
        due.sort_by(|a, b| a.fire_at.cmp(&b.fire_at));

        debug!(at = %at, due = due.len(), "Selected due set");
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use funnel_core::types::{Channel, CustomerProfile};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    fn setup() -> (DueSetSelector, Arc<CampaignStore>, Arc<EnrollmentTracker>, Campaign) {
        let store = Arc::new(CampaignStore::new());
        let tracker = Arc::new(EnrollmentTracker::new(TimeCalculator::utc()));
        let campaign = Campaign::new("p-1", "drip", Channel::Sms)
            .with_stage(Stage::new(1, 0, "welcome"))
            .with_stage(Stage::new(2, 1, "day one"))
            .with_stage(Stage::new(3, 3, "day three"));
        store.create(campaign.clone()).unwrap();
        tracker.enroll_or_reenter(&campaign, &CustomerProfile::new("c-1", "Kim"), t0());
        (DueSetSelector::new(store.clone(), tracker.clone()), store, tracker, campaign)
    }

    #[test]
    fn test_zero_offset_due_at_entry() {
        let (selector, ..) = setup();
        let due = selector.due_now(t0());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].stage.number, 1);
        assert_eq!(due[0].fire_at, t0());
        assert!(selector.due_now(t0() - Duration::seconds(1)).is_empty());
    }

    #[test]
    fn test_same_instant_selects_same_pairs() {
        let (selector, store, tracker, _) = setup();
        let other = Campaign::new("p-1", "second", Channel::Sms)
            .with_stage(Stage::new(1, 0, "hello"));
        store.create(other.clone()).unwrap();
        tracker.enroll_or_reenter(&other, &CustomerProfile::new("c-2", "Lee"), t0());

        let at = t0() + Duration::days(2);
        let pairs = |due: Vec<DuePair>| {
            let mut pairs: Vec<_> = due
                .iter()
                .map(|p| (p.enrollment.key(), p.stage.number, p.fire_at, p.claim().generation))
                .collect();
            pairs.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
            pairs
        };
        let first = pairs(selector.due_now(at));
        assert_eq!(first.len(), 2);
        assert_eq!(first, pairs(selector.due_now(at)));
    }

    #[test]
    fn test_job_carries_stage_title() {
        let (selector, store, _, campaign) = setup();
        let mut edited = campaign.clone();
        edited.stages[0] = Stage::new(1, 0, "welcome").titled("{{customer_name}}님 환영합니다");
        store.update(edited).unwrap();

        let job = selector.due_now(t0()).remove(0).job();
        assert_eq!(job.title, "{{customer_name}}님 환영합니다");
        assert_eq!(job.template, "welcome");
        assert_eq!(job.profile.customer_id, "c-1");
    }

    #[test]
    fn test_pointer_on_sent_stage_selects_next_unsent() {
        let (selector, store, tracker, campaign) = setup();
        let key = crate::types::EnrollmentKey::new("c-1", campaign.id);
        let first = selector.due_now(t0()).remove(0);
        // Stage 0 sorts ahead of stage 1 once added, leaving the pointer on
        // a stage that was already sent.
        let mut edited = campaign.clone();
        edited.stages.push(Stage::new(0, 0, "early").at(0, 0));
        store.update(edited).unwrap();
        tracker.advance(&first.claim(), &first.campaign, t0()).unwrap();
        assert_eq!(tracker.get(&key).unwrap().current_stage_index, 1);

        let due = selector.due_now(t0() + Duration::days(1));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].stage.number, 2);
    }

    #[test]
    fn test_one_stage_per_enrollment_after_long_gap() {
        let (selector, ..) = setup();
        // Every stage is overdue, but only the pointer's stage is selected.
        let due = selector.due_now(t0() + Duration::days(30));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].stage.number, 1);
    }

    #[test]
    fn test_inactive_campaign_contributes_nothing() {
        let (selector, store, _, campaign) = setup();
        store.set_active(&campaign.id, false).unwrap();
        assert!(selector.due_now(t0() + Duration::days(1)).is_empty());
    }

    #[test]
    fn test_paused_enrollment_is_not_due() {
        let (selector, _, tracker, campaign) = setup();
        tracker
            .pause(&crate::types::EnrollmentKey::new("c-1", campaign.id), t0())
            .unwrap();
        assert!(selector.due_now(t0() + Duration::days(1)).is_empty());
    }

    #[test]
    fn test_claim_carries_generation() {
        let (selector, _, tracker, campaign) = setup();
        let later = t0() + Duration::hours(1);
        tracker.enroll_or_reenter(
            &Campaign {
                re_entry_policy: crate::types::ReEntryPolicy::TimeChangeInfoChange,
                ..campaign.clone()
            },
            &CustomerProfile::new("c-1", "Kim"),
            later,
        );
        let due = selector.due_now(later);
        assert_eq!(due[0].claim().generation, 1);
        assert_eq!(due[0].fire_at, later);
    }
}
