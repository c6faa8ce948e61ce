//! Email transport. Records outgoing mail and open/bounce webhooks in
//! memory; a production build swaps in the provider's HTTP API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use funnel_core::config::EmailConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gateway::{DeliveryReceipt, DispatchError, OutboundMessage, SendCapability};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    pub id: Uuid,
    pub to: String,
    pub from_email: String,
    pub from_name: String,
    pub subject: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub opened: bool,
    pub bounced: bool,
}

/// Inbound provider webhook event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum EmailWebhookEvent {
    Open { message_id: Uuid },
    Bounce { message_id: Uuid, reason: String },
}

pub struct EmailProvider {
    config: EmailConfig,
    sent: DashMap<Uuid, EmailMessage>,
}

impl EmailProvider {
    pub fn new(config: EmailConfig) -> Self {
        info!(from = %config.from_email, "Email provider initialized");
        Self {
            config,
            sent: DashMap::new(),
        }
    }

    pub fn process_webhook(&self, event: &EmailWebhookEvent) {
        match event {
            EmailWebhookEvent::Open { message_id } => {
                if let Some(mut msg) = self.sent.get_mut(message_id) {
                    msg.opened = true;
                    metrics::counter!("email.opens").increment(1);
                }
            }
            EmailWebhookEvent::Bounce { message_id, reason } => {
                if let Some(mut msg) = self.sent.get_mut(message_id) {
                    warn!(message_id = %message_id, reason = %reason, to = %msg.to, "Email bounced");
                    msg.bounced = true;
                    metrics::counter!("email.bounces").increment(1);
                }
            }
        }
    }

    pub fn get_message(&self, id: &Uuid) -> Option<EmailMessage> {
        self.sent.get(id).map(|m| m.clone())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.len()
    }
}

#[async_trait]
impl SendCapability for EmailProvider {
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, DispatchError> {
        if !message.recipient.contains('@') {
            return Err(DispatchError::Rejected(format!(
                "invalid email address {:?}",
                message.recipient
            )));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let msg = EmailMessage {
            id,
            to: message.recipient.clone(),
            from_email: message
                .sender
                .email
                .clone()
                .unwrap_or_else(|| self.config.from_email.clone()),
            from_name: message
                .sender
                .name
                .clone()
                .unwrap_or_else(|| self.config.from_name.clone()),
            subject: message.title.clone(),
            body: message.body.clone(),
            sent_at: now,
            opened: false,
            bounced: false,
        };

        debug!(to = %msg.to, subject = %msg.subject, "Sending email");
        metrics::counter!("email.messages_sent").increment(1);
        self.sent.insert(id, msg);

        Ok(DeliveryReceipt {
            provider_message_id: id.to_string(),
            channel: message.channel,
            recipient: message.recipient.clone(),
            accepted_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use funnel_core::types::{Channel, ComplianceFlags, SenderIdentity};

    fn outbound(to: &str) -> OutboundMessage {
        OutboundMessage {
            channel: Channel::Email,
            recipient: to.into(),
            title: "Your itinerary".into(),
            body: "See you at the airport".into(),
            sender: SenderIdentity {
                name: Some("Jeju Tours".into()),
                phone: None,
                email: None,
            },
            compliance: ComplianceFlags::default(),
        }
    }

    #[tokio::test]
    async fn test_send_uses_sender_identity_with_config_fallback() {
        let provider = EmailProvider::new(EmailConfig::default());
        let receipt = provider.send(&outbound("kim@example.com")).await.unwrap();

        let id: Uuid = receipt.provider_message_id.parse().unwrap();
        let msg = provider.get_message(&id).unwrap();
        assert_eq!(msg.from_name, "Jeju Tours");
        assert_eq!(msg.from_email, "no-reply@example.com");
        assert_eq!(msg.subject, "Your itinerary");
    }

    #[tokio::test]
    async fn test_invalid_address_rejected() {
        let provider = EmailProvider::new(EmailConfig::default());
        assert!(provider.send(&outbound("not-an-email")).await.is_err());
        assert_eq!(provider.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_webhooks_update_message() {
        let provider = EmailProvider::new(EmailConfig::default());
        let receipt = provider.send(&outbound("lee@example.com")).await.unwrap();
        let id: Uuid = receipt.provider_message_id.parse().unwrap();

        provider.process_webhook(&EmailWebhookEvent::Open { message_id: id });
        provider.process_webhook(&EmailWebhookEvent::Bounce {
            message_id: id,
            reason: "mailbox full".into(),
        });

        let msg = provider.get_message(&id).unwrap();
        assert!(msg.opened);
        assert!(msg.bounced);
    }
}
