//! SMS transport. Classifies messages as SMS or LMS, records them, and
//! tracks delivery reports. Stands in for the carrier gateway.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use funnel_core::config::SmsConfig;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::{DeliveryReceipt, DispatchError, OutboundMessage, SendCapability};

/// Short messages fit in 90 bytes (Hangul counts as two).
pub const SMS_MAX_BYTES: usize = 90;
/// Long messages are capped at 2000 bytes by carriers.
pub const LMS_MAX_BYTES: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmsKind {
    Sms,
    Lms,
}

/// Status of a message through its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmsStatus {
    Queued,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsMessage {
    pub id: Uuid,
    pub to: String,
    pub from: String,
    pub subject: Option<String>,
    pub body: String,
    pub kind: SmsKind,
    pub status: SmsStatus,
    pub provider_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// In-memory SMS provider.
pub struct SmsProvider {
    config: SmsConfig,
    messages: DashMap<Uuid, SmsMessage>,
    /// Maps provider_id -> message Uuid for delivery-report lookups.
    provider_index: DashMap<String, Uuid>,
}

impl SmsProvider {
    pub fn new(config: SmsConfig) -> Self {
        tracing::info!(
            provider = %config.provider,
            from = %config.sender_number,
            "SMS provider initialized"
        );
        Self {
            config,
            messages: DashMap::new(),
            provider_index: DashMap::new(),
        }
    }

    /// Byte length in the carrier's counting: ASCII is one byte, everything
    /// else (Hangul, symbols) is two.
    pub fn byte_length(body: &str) -> usize {
        body.chars().map(|c| if c.is_ascii() { 1 } else { 2 }).sum()
    }

    pub fn classify(body: &str) -> Option<SmsKind> {
        match Self::byte_length(body) {
            n if n <= SMS_MAX_BYTES => Some(SmsKind::Sms),
            n if n <= LMS_MAX_BYTES => Some(SmsKind::Lms),
            _ => None,
        }
    }

    /// Record a message as queued with the carrier.
    pub fn queue(&self, message: &OutboundMessage) -> Result<SmsMessage, DispatchError> {
        let kind = Self::classify(&message.body).ok_or_else(|| {
            DispatchError::Rejected(format!(
                "message is {} bytes, over the {} byte LMS limit",
                Self::byte_length(&message.body),
                LMS_MAX_BYTES
            ))
        })?;

        let now = Utc::now();
        let id = Uuid::new_v4();
        let provider_id = format!("SM{}", id.simple());
        let from = message
            .sender
            .phone
            .clone()
            .unwrap_or_else(|| self.config.sender_number.clone());

        let msg = SmsMessage {
            id,
            to: message.recipient.clone(),
            from,
            // Only LMS carries a subject line.
            subject: (kind == SmsKind::Lms).then(|| message.title.clone()),
            body: message.body.clone(),
            kind,
            status: SmsStatus::Queued,
            provider_id: provider_id.clone(),
            created_at: now,
            updated_at: now,
        };

        tracing::info!(
            id = %id,
            to = %msg.to,
            provider_id = %provider_id,
            kind = ?kind,
            "SMS message queued"
        );
        metrics::counter!("sms.messages_sent", "kind" => match kind {
            SmsKind::Sms => "sms",
            SmsKind::Lms => "lms",
        })
        .increment(1);

        self.messages.insert(id, msg.clone());
        self.provider_index.insert(provider_id, id);
        Ok(msg)
    }

    pub fn get_message(&self, id: Uuid) -> Option<SmsMessage> {
        self.messages.get(&id).map(|m| m.clone())
    }

    /// Apply a carrier delivery report. Returns false for unknown ids.
    pub fn handle_delivery_report(&self, provider_id: &str, delivered: bool) -> bool {
        let Some(message_id) = self.provider_index.get(provider_id).map(|e| *e.value()) else {
            tracing::warn!(provider_id = %provider_id, "Delivery report for unknown provider_id");
            return false;
        };
        match self.messages.get_mut(&message_id) {
            Some(mut msg) => {
                msg.status = if delivered {
                    SmsStatus::Delivered
                } else {
                    SmsStatus::Failed
                };
                msg.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Up to `limit` most recently created messages.
    pub fn list_messages(&self, limit: usize) -> Vec<SmsMessage> {
        let mut messages: Vec<SmsMessage> = self
            .messages
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        messages.truncate(limit);
        messages
    }

    pub fn sent_count(&self) -> usize {
        self.messages.len()
    }

    pub fn config(&self) -> &SmsConfig {
        &self.config
    }
}

#[async_trait]
impl SendCapability for SmsProvider {
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, DispatchError> {
        let msg = self.queue(message)?;
        Ok(DeliveryReceipt {
            provider_message_id: msg.provider_id,
            channel: message.channel,
            recipient: msg.to,
            accepted_at: msg.created_at,
        })
    }
}
