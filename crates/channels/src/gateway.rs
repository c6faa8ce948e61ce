//! Dispatch gateway. The boundary between the funnel and the channel
//! transports. Renders stage content, resolves the recipient address,
//! and calls the channel's send capability under a timeout.
//! Emits `StageDispatched` or `StageFailed` events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use funnel_core::event_bus::{make_event, EventSink};
use funnel_core::types::{Channel, ComplianceFlags, CustomerProfile, EventType, SenderIdentity};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::render::{decorate, render, RenderContext, RenderError};

/// A fully rendered message handed to a transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: Channel,
    pub recipient: String,
    pub title: String,
    pub body: String,
    pub sender: SenderIdentity,
    pub compliance: ComplianceFlags,
}

/// Proof that a transport accepted a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub provider_message_id: String,
    pub channel: Channel,
    pub recipient: String,
    pub accepted_at: DateTime<Utc>,
}

/// Transient dispatch failures. The enrollment stays where it is and the
/// same stage is retried on the next sweep.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("channel {0} unreachable: {1}")]
    Unreachable(Channel, String),

    #[error("channel {0} rate limited")]
    RateLimited(Channel),

    #[error("provider rejected message: {0}")]
    Rejected(String),

    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("render failed: {0}")]
    Render(#[from] RenderError),

    #[error("customer {customer_id} has no {channel} address")]
    MissingRecipient {
        customer_id: String,
        channel: Channel,
    },

    #[error("no transport registered for channel {0}")]
    ChannelUnavailable(Channel),
}

impl DispatchError {
    pub fn reason(&self) -> &'static str {
        match self {
            DispatchError::Unreachable(..) => "unreachable",
            DispatchError::RateLimited(_) => "rate_limited",
            DispatchError::Rejected(_) => "rejected",
            DispatchError::Timeout(_) => "timeout",
            DispatchError::Render(_) => "render",
            DispatchError::MissingRecipient { .. } => "missing_recipient",
            DispatchError::ChannelUnavailable(_) => "channel_unavailable",
        }
    }
}

/// The external send capability, one implementation per transport.
#[async_trait]
pub trait SendCapability: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, DispatchError>;
}

/// Routes each message to the transport registered for its channel.
#[derive(Default, Clone)]
pub struct ChannelRouter {
    transports: HashMap<Channel, Arc<dyn SendCapability>>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport(mut self, channel: Channel, transport: Arc<dyn SendCapability>) -> Self {
        self.transports.insert(channel, transport);
        self
    }

    /// Channels with a registered transport, in a stable order.
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.transports.keys().copied().collect();
        channels.sort_by_key(|c| c.as_str());
        channels
    }
}

#[async_trait]
impl SendCapability for ChannelRouter {
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, DispatchError> {
        let transport = self
            .transports
            .get(&message.channel)
            .ok_or(DispatchError::ChannelUnavailable(message.channel))?;
        transport.send(message).await
    }
}

/// Everything needed to deliver one stage to one customer.
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub campaign_id: Uuid,
    pub stage_number: u32,
    pub channel: Channel,
    pub title: String,
    pub template: String,
    pub sender: SenderIdentity,
    pub compliance: ComplianceFlags,
    pub profile: CustomerProfile,
}

pub struct DispatchGateway {
    transport: Arc<dyn SendCapability>,
    timeout: Duration,
    partner_name: String,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for DispatchGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchGateway")
            .field("timeout", &self.timeout)
            .field("partner_name", &self.partner_name)
            .finish()
    }
}

impl DispatchGateway {
    pub fn new(transport: Arc<dyn SendCapability>, timeout: Duration, partner_name: &str) -> Self {
        info!(timeout_ms = timeout.as_millis() as u64, partner = %partner_name, "Dispatch gateway initialized");
        Self {
            transport,
            timeout,
            partner_name: partner_name.to_string(),
            event_sink: funnel_core::event_bus::noop_sink(),
        }
    }

    /// Attach an event sink for emitting dispatch events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Render the job into the message a transport would receive.
    pub fn prepare(&self, job: &DispatchJob) -> Result<OutboundMessage, DispatchError> {
        let recipient = job
            .profile
            .address_for(job.channel)
            .ok_or_else(|| DispatchError::MissingRecipient {
                customer_id: job.profile.customer_id.clone(),
                channel: job.channel,
            })?
            .to_string();

        let ctx = RenderContext {
            profile: &job.profile,
            partner_name: &self.partner_name,
        };
        let body = decorate(&render(&job.template, &ctx)?, &job.compliance);
        let title = render(&job.title, &ctx)?;

        Ok(OutboundMessage {
            channel: job.channel,
            recipient,
            title,
            body,
            sender: job.sender.clone(),
            compliance: job.compliance.clone(),
        })
    }

    /// Deliver one stage. Never panics and never retries; the caller decides
    /// what a failure means for the enrollment.
    pub async fn dispatch(&self, job: &DispatchJob) -> Result<DeliveryReceipt, DispatchError> {
        let start = Instant::now();
        let result = match self.prepare(job) {
            Ok(message) => {
                debug!(
                    campaign_id = %job.campaign_id,
                    customer_id = %job.profile.customer_id,
                    stage = job.stage_number,
                    channel = %job.channel,
                    "Sending stage"
                );
                match tokio::time::timeout(self.timeout, self.transport.send(&message)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(DispatchError::Timeout(self.timeout)),
                }
            }
            Err(e) => Err(e),
        };

        let latency_ms = start.elapsed().as_millis() as u64;
        metrics::histogram!("funnel.dispatch.latency_ms", "channel" => job.channel.as_str())
            .record(latency_ms as f64);

        let event_type = match &result {
            Ok(receipt) => {
                metrics::counter!("funnel.dispatch.sent", "channel" => job.channel.as_str())
                    .increment(1);
                info!(
                    campaign_id = %job.campaign_id,
                    customer_id = %job.profile.customer_id,
                    stage = job.stage_number,
                    provider_message_id = %receipt.provider_message_id,
                    "Stage dispatched"
                );
                EventType::StageDispatched
            }
            Err(e) => {
                metrics::counter!(
                    "funnel.dispatch.failed",
                    "channel" => job.channel.as_str(),
                    "reason" => e.reason()
                )
                .increment(1);
                warn!(
                    campaign_id = %job.campaign_id,
                    customer_id = %job.profile.customer_id,
                    stage = job.stage_number,
                    error = %e,
                    "Stage dispatch failed, will retry next sweep"
                );
                EventType::StageFailed
            }
        };
        self.event_sink.emit(make_event(
            event_type,
            Some(job.campaign_id),
            Some(&job.profile.customer_id),
            Some(job.stage_number),
        ));

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use funnel_core::event_bus::capture_sink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recording {
        calls: AtomicUsize,
        last_body: parking_lot::Mutex<Option<String>>,
    }

    #[async_trait]
    impl SendCapability for Recording {
        async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_body.lock() = Some(message.body.clone());
            Ok(DeliveryReceipt {
                provider_message_id: "rec-1".into(),
                channel: message.channel,
                recipient: message.recipient.clone(),
                accepted_at: Utc::now(),
            })
        }
    }

    struct Stalled;

    #[async_trait]
    impl SendCapability for Stalled {
        async fn send(&self, _message: &OutboundMessage) -> Result<DeliveryReceipt, DispatchError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(DispatchError::Rejected("unreachable".into()))
        }
    }

    fn job(channel: Channel) -> DispatchJob {
        DispatchJob {
            campaign_id: Uuid::new_v4(),
            stage_number: 1,
            channel,
            title: "여행 안내".into(),
            template: "{{customer_name}}님 출발 3일 전입니다".into(),
            sender: SenderIdentity::default(),
            compliance: ComplianceFlags::default(),
            profile: CustomerProfile::new("c-1", "박서준").with_phone("010-1111-2222"),
        }
    }

    fn recording() -> Arc<Recording> {
        Arc::new(Recording {
            calls: AtomicUsize::new(0),
            last_body: parking_lot::Mutex::new(None),
        })
    }

    #[tokio::test]
    async fn test_dispatch_renders_and_sends() {
        let transport = recording();
        let sink = capture_sink();
        let router = ChannelRouter::new().with_transport(Channel::Sms, transport.clone());
        let gateway = DispatchGateway::new(Arc::new(router), Duration::from_secs(1), "agency")
            .with_event_sink(sink.clone());

        let receipt = gateway.dispatch(&job(Channel::Sms)).await.unwrap();
        assert_eq!(receipt.recipient, "010-1111-2222");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            transport.last_body.lock().as_deref(),
            Some("박서준님 출발 3일 전입니다")
        );
        assert_eq!(sink.count_type(EventType::StageDispatched), 1);
    }

    #[tokio::test]
    async fn test_unregistered_channel_fails() {
        let gateway = DispatchGateway::new(
            Arc::new(ChannelRouter::new()),
            Duration::from_secs(1),
            "agency",
        );
        let err = gateway.dispatch(&job(Channel::Sms)).await.unwrap_err();
        assert_eq!(err, DispatchError::ChannelUnavailable(Channel::Sms));
    }

    #[test]
    fn test_router_lists_registered_channels() {
        let router = ChannelRouter::new()
            .with_transport(Channel::Sms, recording())
            .with_transport(Channel::Email, recording());
        assert_eq!(router.channels(), vec![Channel::Email, Channel::Sms]);
        assert!(ChannelRouter::new().channels().is_empty());
    }

    #[tokio::test]
    async fn test_missing_address_fails_without_sending() {
        let transport = recording();
        let router = ChannelRouter::new().with_transport(Channel::Email, transport.clone());
        let gateway = DispatchGateway::new(Arc::new(router), Duration::from_secs(1), "agency");

        let err = gateway.dispatch(&job(Channel::Email)).await.unwrap_err();
        assert!(matches!(err, DispatchError::MissingRecipient { .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_transport_times_out() {
        let sink = capture_sink();
        let router = ChannelRouter::new().with_transport(Channel::Sms, Arc::new(Stalled));
        let gateway = DispatchGateway::new(Arc::new(router), Duration::from_millis(50), "agency")
            .with_event_sink(sink.clone());

        let err = gateway.dispatch(&job(Channel::Sms)).await.unwrap_err();
        assert_eq!(err, DispatchError::Timeout(Duration::from_millis(50)));
        assert_eq!(sink.count_type(EventType::StageFailed), 1);
    }
}
