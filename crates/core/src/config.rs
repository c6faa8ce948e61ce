use chrono_tz::Tz;
use serde::Deserialize;

use crate::error::{FunnelError, FunnelResult};

/// Root application configuration. Loaded from environment variables
/// with the prefix `FUNNEL_SCHEDULER__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub partner: PartnerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sms: SmsConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// The partner whose calendar drives day-offset arithmetic.
#[derive(Debug, Clone, Deserialize)]
pub struct PartnerConfig {
    #[serde(default = "default_partner_name")]
    pub name: String,
    /// IANA time zone name, e.g. `Asia/Seoul`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_max_concurrent_dispatches")]
    pub max_concurrent_dispatches: usize,
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmsConfig {
    #[serde(default = "default_sms_provider")]
    pub provider: String,
    #[serde(default = "default_sender_number")]
    pub sender_number: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    #[serde(default = "default_from_email")]
    pub from_email: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "scheduler-01".to_string()
}
fn default_partner_name() -> String {
    "default-partner".to_string()
}
fn default_timezone() -> String {
    "Asia/Seoul".to_string()
}
fn default_scheduler_enabled() -> bool {
    true
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_max_concurrent_dispatches() -> usize {
    16
}
fn default_dispatch_timeout_ms() -> u64 {
    10_000
}
fn default_sms_provider() -> String {
    "in-memory".to_string()
}
fn default_sender_number() -> String {
    "1588-0000".to_string()
}
fn default_from_email() -> String {
    "no-reply@example.com".to_string()
}
fn default_from_name() -> String {
    "Travel Partner".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for PartnerConfig {
    fn default() -> Self {
        Self {
            name: default_partner_name(),
            timezone: default_timezone(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_concurrent_dispatches: default_max_concurrent_dispatches(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
        }
    }
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            provider: default_sms_provider(),
            sender_number: default_sender_number(),
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            from_email: default_from_email(),
            from_name: default_from_name(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            partner: PartnerConfig::default(),
            scheduler: SchedulerConfig::default(),
            sms: SmsConfig::default(),
            email: EmailConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl PartnerConfig {
    /// Parse the configured time zone.
    pub fn tz(&self) -> FunnelResult<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| FunnelError::Config(format!("invalid timezone {:?}: {}", self.timezone, e)))
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("FUNNEL_SCHEDULER")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> FunnelResult<()> {
        self.partner.tz()?;
        if self.scheduler.sweep_interval_secs == 0 {
            return Err(FunnelError::Config(
                "scheduler.sweep_interval_secs must be positive".into(),
            ));
        }
        if self.scheduler.max_concurrent_dispatches == 0 {
            return Err(FunnelError::Config(
                "scheduler.max_concurrent_dispatches must be positive".into(),
            ));
        }
        Ok(())
    }
}
