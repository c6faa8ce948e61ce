//! Channel boundary for funnel messages.
//!
//! Render: placeholder substitution and advertising-law decoration.
//! Dispatch: timeout-guarded delivery through per-channel send capabilities.

pub mod email;
pub mod gateway;
pub mod render;
pub mod sms;

pub use email::EmailProvider;
pub use gateway::{
    ChannelRouter, DeliveryReceipt, DispatchError, DispatchGateway, DispatchJob, OutboundMessage,
    SendCapability,
};
pub use sms::SmsProvider;
