//! Campaign store. Campaigns and their stages are read and written as one
//! aggregate. A write either passes validation as a whole or changes nothing.

use std::collections::HashSet;

use chrono::Utc;
use dashmap::DashMap;
use funnel_channels::render::validate_template;
use funnel_core::error::{FunnelError, FunnelResult};
use funnel_core::types::Channel;
use tracing::info;
use uuid::Uuid;

use crate::types::Campaign;

/// Upper bound on a stage's day offset (ten years).
pub const MAX_DAY_OFFSET: u32 = 3650;

#[derive(Default)]
pub struct CampaignStore {
    campaigns: DashMap<Uuid, Campaign>,
}

impl std::fmt::Debug for CampaignStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CampaignStore")
            .field("campaigns", &self.campaigns.len())
            .finish()
    }
}

impl CampaignStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check every write-time rule for a campaign aggregate.
    pub fn validate(campaign: &Campaign) -> FunnelResult<()> {
        if campaign.name.trim().is_empty() {
            return Err(FunnelError::validation("campaign name must not be empty"));
        }
        if campaign.partner_id.trim().is_empty() {
            return Err(FunnelError::validation("campaign partner must not be empty"));
        }

        let flags = &campaign.compliance;
        if flags.requires_opt_out() && flags.opt_out_contact.trim().is_empty() {
            return Err(FunnelError::validation(
                "advertisement with auto opt-out requires an opt-out contact",
            ));
        }

        if let Some(email) = &campaign.sender.email {
            if !email.contains('@') {
                return Err(FunnelError::validation(format!(
                    "sender email {:?} is not an address",
                    email
                )));
            }
        }
        if campaign.channel == Channel::Email && campaign.sender.email.is_none() && campaign.sender.name.is_none() {
            return Err(FunnelError::validation(
                "email campaigns need a sender name or address",
            ));
        }

        let mut numbers = HashSet::with_capacity(campaign.stages.len());
        for stage in &campaign.stages {
            if !numbers.insert(stage.number) {
                return Err(FunnelError::validation(format!(
                    "duplicate stage number {}",
                    stage.number
                )));
            }
            if stage.day_offset > MAX_DAY_OFFSET {
                return Err(FunnelError::validation(format!(
                    "stage {} day offset {} exceeds {}",
                    stage.number, stage.day_offset, MAX_DAY_OFFSET
                )));
            }
            if stage.title.trim().is_empty() {
                return Err(FunnelError::validation(format!(
                    "stage {} title must not be empty",
                    stage.number
                )));
            }
            if stage.content.trim().is_empty() {
                return Err(FunnelError::validation(format!(
                    "stage {} content must not be empty",
                    stage.number
                )));
            }
            for text in [&stage.title, &stage.content] {
                validate_template(text).map_err(|e| {
                    FunnelError::validation(format!("stage {}: {}", stage.number, e))
                })?;
            }
        }
        Ok(())
    }

    pub fn create(&self, mut campaign: Campaign) -> FunnelResult<Uuid> {
        Self::validate(&campaign)?;
        let id = campaign.id;
        if self.campaigns.contains_key(&id) {
            return Err(FunnelError::validation(format!("campaign {} already exists", id)));
        }
        let now = Utc::now();
        campaign.created_at = now;
        campaign.updated_at = now;
        campaign.version = 1;

        info!(
            campaign_id = %id,
            name = %campaign.name,
            channel = %campaign.channel,
            stages = campaign.stages.len(),
            "Creating campaign"
        );
        self.campaigns.insert(id, campaign);
        Ok(id)
    }

    /// Replace a campaign aggregate. Returns the stored version.
    pub fn update(&self, mut campaign: Campaign) -> FunnelResult<Campaign> {
        Self::validate(&campaign)?;
        let mut entry = self
            .campaigns
            .get_mut(&campaign.id)
            .ok_or_else(|| FunnelError::not_found(format!("campaign {}", campaign.id)))?;

        campaign.created_at = entry.created_at;
        campaign.updated_at = Utc::now();
        campaign.version = entry.version + 1;
        info!(campaign_id = %campaign.id, version = campaign.version, "Updating campaign");
        *entry = campaign.clone();
        Ok(campaign)
    }

    pub fn get(&self, id: &Uuid) -> Option<Campaign> {
        self.campaigns.get(id).map(|r| r.clone())
    }

    pub fn set_active(&self, id: &Uuid, active: bool) -> FunnelResult<()> {
        let mut entry = self
            .campaigns
            .get_mut(id)
            .ok_or_else(|| FunnelError::not_found(format!("campaign {}", id)))?;
        info!(campaign_id = %id, active, "Setting campaign active flag");
        entry.active = active;
        entry.updated_at = Utc::now();
        Ok(())
    }

    pub fn delete(&self, id: &Uuid) -> FunnelResult<Campaign> {
        let (_, campaign) = self
            .campaigns
            .remove(id)
            .ok_or_else(|| FunnelError::not_found(format!("campaign {}", id)))?;
        info!(campaign_id = %id, "Deleted campaign");
        Ok(campaign)
    }

    pub fn list_by_partner(&self, partner_id: &str) -> Vec<Campaign> {
        self.campaigns
            .iter()
            .filter(|r| r.partner_id == partner_id)
            .map(|r| r.value().clone())
            .collect()
    }

    /// Enabled campaigns targeting `group_id`, in no particular order.
    pub fn list_active_campaigns_for_group(&self, group_id: &Uuid) -> Vec<Campaign> {
        self.campaigns
            .iter()
            .filter(|r| r.active && r.target_group_id.as_ref() == Some(group_id))
            .map(|r| r.value().clone())
            .collect()
    }

    /// All campaigns targeting `group_id`, enabled or not.
    pub fn list_campaigns_for_group(&self, group_id: &Uuid) -> Vec<Campaign> {
        self.campaigns
            .iter()
            .filter(|r| r.target_group_id.as_ref() == Some(group_id))
            .map(|r| r.value().clone())
            .collect()
    }

    /// Enabled campaigns with no target group for a partner.
    pub fn list_active_partner_wide(&self, partner_id: &str) -> Vec<Campaign> {
        self.campaigns
            .iter()
            .filter(|r| r.active && r.is_partner_wide() && r.partner_id == partner_id)
            .map(|r| r.value().clone())
            .collect()
    }

    pub fn list_active(&self) -> Vec<Campaign> {
        self.campaigns
            .iter()
            .filter(|r| r.active)
            .map(|r| r.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.campaigns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.campaigns.is_empty()
    }
}
