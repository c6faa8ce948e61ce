use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc};
use funnel_core::types::{Channel, ComplianceFlags, CustomerProfile, SenderIdentity};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// A drip-message definition: an ordered set of stages bound to one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub partner_id: String,
    pub name: String,
    pub channel: Channel,
    pub active: bool,
    /// `None` means the campaign applies to every customer of the partner.
    pub target_group_id: Option<Uuid>,
    #[serde(default)]
    pub re_entry_policy: ReEntryPolicy,
    #[serde(default)]
    pub compliance: ComplianceFlags,
    #[serde(default)]
    pub sender: SenderIdentity,
    pub stages: Vec<Stage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u32,
}

impl Campaign {
    pub fn new(partner_id: &str, name: &str, channel: Channel) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            partner_id: partner_id.to_string(),
            name: name.to_string(),
            channel,
            active: true,
            target_group_id: None,
            re_entry_policy: ReEntryPolicy::default(),
            compliance: ComplianceFlags::default(),
            sender: SenderIdentity::default(),
            stages: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    pub fn targeting(mut self, group_id: Uuid) -> Self {
        self.target_group_id = Some(group_id);
        self
    }

    pub fn with_policy(mut self, policy: ReEntryPolicy) -> Self {
        self.re_entry_policy = policy;
        self
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn is_partner_wide(&self) -> bool {
        self.target_group_id.is_none()
    }
}

/// One message in a campaign, fired a number of calendar days after entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub number: u32,
    pub day_offset: u32,
    /// Local clock time to fire at; `None` keeps the entry's clock time.
    pub time_of_day: Option<NaiveTime>,
    pub title: String,
    pub content: String,
}

impl Stage {
    pub fn new(number: u32, day_offset: u32, content: &str) -> Self {
        Self {
            number,
            day_offset,
            time_of_day: None,
            title: format!("Stage {}", number),
            content: content.to_string(),
        }
    }

    pub fn at(mut self, hour: u32, minute: u32) -> Self {
        self.time_of_day = NaiveTime::from_hms_opt(hour, minute, 0);
        self
    }

    pub fn titled(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }
}

/// What happens to an existing enrollment when its customer is re-added
/// to the campaign's group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReEntryPolicy {
    /// Keep timing and progress; refresh the customer snapshot.
    NoTimeChangeInfoChange,
    /// Re-entry is a no-op for the funnel.
    #[default]
    NoTimeChangeNoInfoChange,
    /// Restart from the first stage with a new anchor and fresh snapshot.
    TimeChangeInfoChange,
}

impl ReEntryPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReEntryPolicy::NoTimeChangeInfoChange => "no_time_change_info_change",
            ReEntryPolicy::NoTimeChangeNoInfoChange => "no_time_change_no_info_change",
            ReEntryPolicy::TimeChangeInfoChange => "time_change_info_change",
        }
    }

    pub fn resets_timing(&self) -> bool {
        matches!(self, ReEntryPolicy::TimeChangeInfoChange)
    }

    pub fn refreshes_profile(&self) -> bool {
        !matches!(self, ReEntryPolicy::NoTimeChangeNoInfoChange)
    }

    /// Parse a stored policy value. Unknown values fall back to the policy
    /// that can never cause a duplicate send.
    pub fn parse_lenient(raw: &str) -> Self {
        raw.parse().unwrap_or_else(|_| {
            tracing::warn!(
                value = %raw,
                fallback = ReEntryPolicy::default().as_str(),
                "Data integrity warning: unknown re-entry policy"
            );
            ReEntryPolicy::default()
        })
    }
}

impl fmt::Display for ReEntryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReEntryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "no_time_change_info_change" => Ok(ReEntryPolicy::NoTimeChangeInfoChange),
            "no_time_change_no_info_change" => Ok(ReEntryPolicy::NoTimeChangeNoInfoChange),
            "time_change_info_change" => Ok(ReEntryPolicy::TimeChangeInfoChange),
            other => Err(format!("unknown re-entry policy {:?}", other)),
        }
    }
}

impl<'de> Deserialize<'de> for ReEntryPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(ReEntryPolicy::parse_lenient(&raw))
    }
}

/// Named customer roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudienceGroup {
    pub id: Uuid,
    pub partner_id: String,
    pub name: String,
    pub color: Option<String>,
    pub description: Option<String>,
    pub product_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AudienceGroup {
    pub fn new(partner_id: &str, name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            partner_id: partner_id.to_string(),
            name: name.to_string(),
            color: None,
            description: None,
            product_code: None,
            created_at: Utc::now(),
        }
    }
}

/// A customer's presence in a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub group_id: Uuid,
    pub customer_id: String,
    pub entered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnrollmentKey {
    pub customer_id: String,
    pub campaign_id: Uuid,
}

impl EnrollmentKey {
    pub fn new(customer_id: &str, campaign_id: Uuid) -> Self {
        Self {
            customer_id: customer_id.to_string(),
            campaign_id,
        }
    }
}

impl fmt::Display for EnrollmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.campaign_id, self.customer_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Completed,
}

/// One customer's progress through one campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub customer_id: String,
    pub campaign_id: Uuid,
    /// Base instant for day-offset arithmetic.
    pub anchor_at: DateTime<Utc>,
    /// Index into the campaign's fire-ordered stage sequence.
    pub current_stage_index: usize,
    pub sent_stage_numbers: BTreeSet<u32>,
    pub status: EnrollmentStatus,
    /// Customer snapshot used to render stage content.
    pub profile: CustomerProfile,
    /// Bumped on every restart so in-flight dispatches from before the
    /// restart cannot advance the new run.
    pub generation: u64,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn new(campaign_id: Uuid, profile: CustomerProfile, anchor_at: DateTime<Utc>) -> Self {
        Self {
            customer_id: profile.customer_id.clone(),
            campaign_id,
            anchor_at,
            current_stage_index: 0,
            sent_stage_numbers: BTreeSet::new(),
            status: EnrollmentStatus::Active,
            profile,
            generation: 0,
            enrolled_at: anchor_at,
            updated_at: anchor_at,
        }
    }

    pub fn key(&self) -> EnrollmentKey {
        EnrollmentKey::new(&self.customer_id, self.campaign_id)
    }

    pub fn is_active(&self) -> bool {
        self.status == EnrollmentStatus::Active
    }
}

/// Effect of an entry event on one campaign's enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOutcome {
    Enrolled,
    Restarted,
    ProfileRefreshed,
    Unchanged,
}

/// Everything one membership add did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryReport {
    pub group_id: Uuid,
    pub customer_id: String,
    pub reentry: bool,
    pub entered_at: DateTime<Utc>,
    pub outcomes: Vec<(Uuid, EntryOutcome)>,
}

impl EntryReport {
    pub fn outcome_for(&self, campaign_id: Uuid) -> Option<EntryOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| *id == campaign_id)
            .map(|(_, o)| *o)
    }
}

/// Per-campaign counters for the operator dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignStats {
    pub campaign_id: Uuid,
    pub enrolled: u64,
    pub active: u64,
    pub paused: u64,
    pub completed: u64,
    pub dispatched: u64,
    pub failed: u64,
}
