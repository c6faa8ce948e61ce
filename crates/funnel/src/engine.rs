use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use funnel_channels::{DispatchGateway, SendCapability};
use funnel_core::clock::Clock;
use funnel_core::config::SchedulerConfig;
use funnel_core::error::{FunnelError, FunnelResult};
use funnel_core::event_bus::{make_event, EventSink};
use funnel_core::types::{CustomerProfile, EventType};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audience::{AudienceRegistry, MembershipChange};
use crate::scheduler::Scheduler;
use crate::selector::DueSetSelector;
use crate::store::CampaignStore;
use crate::time::TimeCalculator;
use crate::tracker::EnrollmentTracker;
use crate::types::{
    AudienceGroup, Campaign, CampaignStats, Enrollment, EnrollmentKey, EntryOutcome, EntryReport,
    Membership, ReEntryPolicy,
};

/// One row of a bulk membership import.
#[derive(Debug, Clone)]
pub struct BulkRow {
    pub profile: CustomerProfile,
    /// Entry instant; `None` means now.
    pub entered_at: Option<DateTime<Utc>>,
}

/// Per-row result of a bulk import. Row failures do not stop the import.
#[derive(Debug)]
pub struct BulkRowResult {
    pub customer_id: String,
    pub outcome: FunnelResult<EntryReport>,
}

/// Single entry point for campaigns, audience groups, and enrollments. Owns
/// the cascades between them.
#[derive(Clone)]
pub struct FunnelEngine {
    store: Arc<CampaignStore>,
    audience: Arc<AudienceRegistry>,
    tracker: Arc<EnrollmentTracker>,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for FunnelEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunnelEngine")
            .field("campaigns", &self.store.len())
            .field("enrollments", &self.tracker.len())
            .finish()
    }
}

impl FunnelEngine {
    pub fn new(time: TimeCalculator, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Arc::new(CampaignStore::new()),
            audience: Arc::new(AudienceRegistry::new()),
            tracker: Arc::new(EnrollmentTracker::new(time)),
            clock,
            event_sink: funnel_core::event_bus::noop_sink(),
        }
    }

    /// Attach an event sink for emitting funnel events. Call before any
    /// customer is enrolled; the enrollment tracker is rebuilt.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.tracker = Arc::new(
            EnrollmentTracker::new(*self.tracker.time()).with_event_sink(sink.clone()),
        );
        self.event_sink = sink;
        self
    }

    pub fn store(&self) -> &Arc<CampaignStore> {
        &self.store
    }

    pub fn audience(&self) -> &Arc<AudienceRegistry> {
        &self.audience
    }

    pub fn tracker(&self) -> &Arc<EnrollmentTracker> {
        &self.tracker
    }

    pub fn selector(&self) -> DueSetSelector {
        DueSetSelector::new(self.store.clone(), self.tracker.clone())
    }

    /// Build a sweep scheduler over this engine's state, sending through
    /// `transport`.
    pub fn scheduler(
        &self,
        transport: Arc<dyn SendCapability>,
        partner_name: &str,
        config: SchedulerConfig,
    ) -> Scheduler {
        let gateway = DispatchGateway::new(
            transport,
            Duration::from_millis(config.dispatch_timeout_ms),
            partner_name,
        )
        .with_event_sink(self.event_sink.clone());
        Scheduler::new(
            Arc::new(self.selector()),
            self.tracker.clone(),
            Arc::new(gateway),
            self.clock.clone(),
            config,
        )
    }

    // ─── Campaigns ───────────────────────────────────────────────────────

    fn check_target(&self, campaign: &Campaign) -> FunnelResult<()> {
        let Some(group_id) = campaign.target_group_id else {
            return Ok(());
        };
        let group = self
            .audience
            .get_group(&group_id)
            .ok_or_else(|| FunnelError::validation(format!("target group {} does not exist", group_id)))?;
        if group.partner_id != campaign.partner_id {
            return Err(FunnelError::validation(format!(
                "target group {} belongs to another partner",
                group_id
            )));
        }
        Ok(())
    }

    /// Existing members of the target group are not backfilled; only later
    /// entries enroll.
    pub fn create_campaign(&self, campaign: Campaign) -> FunnelResult<Uuid> {
        self.check_target(&campaign)?;
        self.store.create(campaign)
    }

    /// Replace a campaign aggregate and re-align its enrollments with the
    /// new stage ordering.
    pub fn update_campaign(&self, campaign: Campaign) -> FunnelResult<Campaign> {
        self.check_target(&campaign)?;
        let stored = self.store.update(campaign)?;
        self.tracker.reconcile_campaign(&stored);
        Ok(stored)
    }

    pub fn get_campaign(&self, id: &Uuid) -> Option<Campaign> {
        self.store.get(id)
    }

    pub fn list_campaigns(&self, partner_id: &str) -> Vec<Campaign> {
        self.store.list_by_partner(partner_id)
    }

    pub fn list_campaigns_for_group(&self, group_id: &Uuid) -> Vec<Campaign> {
        self.store.list_campaigns_for_group(group_id)
    }

    /// Takes effect on the next sweep; dispatches already in flight finish.
    pub fn set_campaign_active(&self, id: &Uuid, active: bool) -> FunnelResult<()> {
        self.store.set_active(id, active)
    }

    /// Set a campaign's re-entry policy from its text form. Unknown values
    /// fall back to the no-op policy and raise a data-integrity event.
    pub fn set_re_entry_policy(&self, id: &Uuid, raw: &str) -> FunnelResult<ReEntryPolicy> {
        let mut campaign = self
            .store
            .get(id)
            .ok_or_else(|| FunnelError::not_found(format!("campaign {}", id)))?;
        if raw.parse::<ReEntryPolicy>().is_err() {
            self.event_sink.emit(make_event(
                EventType::DataIntegrityWarning,
                Some(*id),
                None,
                None,
            ));
        }
        campaign.re_entry_policy = ReEntryPolicy::parse_lenient(raw);
        let stored = self.store.update(campaign)?;
        Ok(stored.re_entry_policy)
    }

    /// Delete a campaign and discard its enrollments.
    pub fn delete_campaign(&self, id: &Uuid) -> FunnelResult<Campaign> {
        let campaign = self.store.delete(id)?;
        let discarded = self.tracker.remove_for_campaign(id);
        info!(campaign_id = %id, discarded, "Campaign enrollments discarded");
        Ok(campaign)
    }

    // ─── Audience ────────────────────────────────────────────────────────

    pub fn create_group(&self, group: AudienceGroup) -> FunnelResult<Uuid> {
        self.audience.create_group(group)
    }

    pub fn list_groups(&self, partner_id: &str) -> Vec<AudienceGroup> {
        self.audience.list_groups(partner_id)
    }

    /// Refused while any campaign still targets the group.
    pub fn delete_group(&self, group_id: &Uuid) -> FunnelResult<()> {
        let group = self
            .audience
            .get_group(group_id)
            .ok_or_else(|| FunnelError::not_found(format!("group {}", group_id)))?;
        let targeting = self.store.list_campaigns_for_group(group_id);
        if !targeting.is_empty() {
            return Err(FunnelError::validation(format!(
                "group {} is targeted by {} campaign(s)",
                group_id,
                targeting.len()
            )));
        }
        for membership in self.audience.delete_group(group_id)? {
            self.drop_partner_wide_if_gone(&group.partner_id, &membership.customer_id);
        }
        Ok(())
    }

    /// Add a customer to a group: an entry or re-entry event for every
    /// enabled campaign targeting the group and for the partner's
    /// partner-wide campaigns.
    pub fn add_member(
        &self,
        group_id: &Uuid,
        profile: CustomerProfile,
        entered_at: Option<DateTime<Utc>>,
    ) -> FunnelResult<EntryReport> {
        let group = self
            .audience
            .get_group(group_id)
            .ok_or_else(|| FunnelError::not_found(format!("group {}", group_id)))?;
        let at = entered_at.unwrap_or_else(|| self.clock.now());
        let change = self.audience.enter(group_id, &profile.customer_id, at)?;

        let mut outcomes = Vec::new();
        for campaign in self.store.list_active_campaigns_for_group(group_id) {
            outcomes.push((campaign.id, self.tracker.enroll_or_reenter(&campaign, &profile, at)));
        }
        // Re-entering the same group resolves a partner-wide campaign's
        // re-entry policy like a targeted one; a first entry into another of
        // the partner's groups leaves an existing enrollment alone.
        for campaign in self.store.list_active_partner_wide(&group.partner_id) {
            let outcome = if change.is_reentry() {
                self.tracker.enroll_or_reenter(&campaign, &profile, at)
            } else {
                self.tracker.ensure_enrolled(&campaign, &profile, at)
            };
            outcomes.push((campaign.id, outcome));
        }

        let event_type = match change {
            MembershipChange::Entered(_) => EventType::MemberEntered,
            MembershipChange::Reentered { .. } => EventType::MemberReentered,
        };
        self.event_sink
            .emit(make_event(event_type, None, Some(&profile.customer_id), None));

        let enrolled = outcomes
            .iter()
            .filter(|(_, o)| matches!(o, EntryOutcome::Enrolled | EntryOutcome::Restarted))
            .count();
        info!(
            group_id = %group_id,
            customer_id = %profile.customer_id,
            reentry = change.is_reentry(),
            campaigns = outcomes.len(),
            enrolled,
            "Member added"
        );

        Ok(EntryReport {
            group_id: *group_id,
            customer_id: profile.customer_id,
            reentry: change.is_reentry(),
            entered_at: at,
            outcomes,
        })
    }

    /// Apply each row as an entry event, in order, continuing past failures.
    pub fn bulk_add(&self, group_id: &Uuid, rows: Vec<BulkRow>) -> Vec<BulkRowResult> {
        let total = rows.len();
        let results: Vec<BulkRowResult> = rows
            .into_iter()
            .map(|row| BulkRowResult {
                customer_id: row.profile.customer_id.clone(),
                outcome: self.add_member(group_id, row.profile, row.entered_at),
            })
            .collect();
        let failed = results.iter().filter(|r| r.outcome.is_err()).count();
        if failed > 0 {
            warn!(group_id = %group_id, total, failed, "Bulk import finished with rejected rows");
        } else {
            info!(group_id = %group_id, total, "Bulk import finished");
        }
        results
    }

    /// Remove a customer from a group and destroy their enrollments in
    /// campaigns targeting it. Returns the removed membership.
    pub fn remove_member(&self, group_id: &Uuid, customer_id: &str) -> FunnelResult<Membership> {
        let group = self
            .audience
            .get_group(group_id)
            .ok_or_else(|| FunnelError::not_found(format!("group {}", group_id)))?;
        let membership = self.audience.remove(group_id, customer_id)?;

        let mut destroyed = 0;
        for campaign in self.store.list_campaigns_for_group(group_id) {
            if self
                .tracker
                .remove(&EnrollmentKey::new(customer_id, campaign.id))
                .is_some()
            {
                destroyed += 1;
            }
        }
        destroyed += self.drop_partner_wide_if_gone(&group.partner_id, customer_id);

        self.event_sink
            .emit(make_event(EventType::MemberRemoved, None, Some(customer_id), None));
        info!(group_id = %group_id, customer_id = %customer_id, destroyed, "Member removed");
        Ok(membership)
    }

    fn drop_partner_wide_if_gone(&self, partner_id: &str, customer_id: &str) -> usize {
        if self.audience.is_partner_member(partner_id, customer_id) {
            return 0;
        }
        self.store
            .list_by_partner(partner_id)
            .into_iter()
            .filter(|c| c.is_partner_wide())
            .filter_map(|c| self.tracker.remove(&EnrollmentKey::new(customer_id, c.id)))
            .count()
    }

    // ─── Enrollments ─────────────────────────────────────────────────────

    pub fn get_enrollment(&self, key: &EnrollmentKey) -> Option<Enrollment> {
        self.tracker.get(key)
    }

    pub fn list_enrollments(&self, campaign_id: &Uuid) -> Vec<Enrollment> {
        self.tracker.list_for_campaign(campaign_id)
    }

    pub fn pause_enrollment(&self, key: &EnrollmentKey) -> FunnelResult<()> {
        self.tracker.pause(key, self.clock.now())
    }

    pub fn resume_enrollment(&self, key: &EnrollmentKey) -> FunnelResult<()> {
        self.tracker.resume(key, self.clock.now())
    }

    pub fn campaign_stats(&self, campaign_id: &Uuid) -> FunnelResult<CampaignStats> {
        if self.store.get(campaign_id).is_none() {
            return Err(FunnelError::not_found(format!("campaign {}", campaign_id)));
        }
        Ok(self.tracker.stats(campaign_id))
    }
}
