use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery channel a campaign is bound to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    Sms,
    Email,
    Chat,
    VoiceGuide,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Email => "email",
            Channel::Chat => "chat",
            Channel::VoiceGuide => "voice-guide",
        }
    }

    /// Channels addressed by phone number rather than email or share link.
    pub fn uses_phone(&self) -> bool {
        matches!(self, Channel::Sms | Channel::VoiceGuide)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advertising-law flags attached to a campaign.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceFlags {
    pub is_advertisement: bool,
    pub auto_append_ad_tag: bool,
    pub auto_append_opt_out: bool,
    #[serde(default)]
    pub opt_out_contact: String,
}

impl ComplianceFlags {
    pub fn requires_ad_tag(&self) -> bool {
        self.is_advertisement && self.auto_append_ad_tag
    }

    pub fn requires_opt_out(&self) -> bool {
        self.is_advertisement && self.auto_append_opt_out
    }
}

/// Who the message appears to come from. Which field matters depends on
/// the channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderIdentity {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

/// Snapshot of the customer fields a stage template can reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub customer_id: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    /// Chat-bot share link or other landing URL for this customer.
    pub link: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl CustomerProfile {
    pub fn new(customer_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    /// The address a given channel delivers to, if the profile has one.
    pub fn address_for(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Sms | Channel::VoiceGuide => self.phone.as_deref(),
            Channel::Email => self.email.as_deref(),
            Channel::Chat => self.link.as_deref().or(self.phone.as_deref()),
        }
    }
}

/// Lifecycle event emitted by the funnel for analytics and operator views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub campaign_id: Option<Uuid>,
    pub customer_id: Option<String>,
    pub stage_number: Option<u32>,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Membership events
    MemberEntered,
    MemberReentered,
    MemberRemoved,
    // Enrollment events
    EnrollmentCreated,
    EnrollmentReset,
    EnrollmentPaused,
    EnrollmentResumed,
    EnrollmentCompleted,
    // Dispatch events
    StageDispatched,
    StageFailed,
    // Data-quality events
    DataIntegrityWarning,
}
