//! Funnel Scheduler. Sweeps partner drip campaigns and dispatches due stages.
//!
//! Main entry point that wires configuration, transports, and the sweep loop.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use funnel_channels::{ChannelRouter, EmailProvider, SmsProvider};
use funnel_core::clock::system_clock;
use funnel_core::config::AppConfig;
use funnel_core::types::{Channel, CustomerProfile, SenderIdentity};
use funnel_engine::types::{AudienceGroup, Campaign, ReEntryPolicy, Stage};
use funnel_engine::{FunnelEngine, TimeCalculator};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "funnel-scheduler")]
#[command(about = "Drip-campaign scheduler for partner audience funnels")]
#[command(version)]
struct Cli {
    /// Seconds between sweeps (overrides config)
    #[arg(long, env = "FUNNEL_SCHEDULER__SCHEDULER__SWEEP_INTERVAL_SECS")]
    sweep_interval: Option<u64>,

    /// Partner IANA time zone (overrides config)
    #[arg(long, env = "FUNNEL_SCHEDULER__PARTNER__TIMEZONE")]
    timezone: Option<String>,

    /// Prometheus exporter port (overrides config)
    #[arg(long, env = "FUNNEL_SCHEDULER__METRICS__PORT")]
    metrics_port: Option<u16>,

    /// Run a single sweep and exit
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Create a demo group, campaign, and members before sweeping
    #[arg(long, default_value_t = false)]
    seed_demo: bool,
}

fn start_metrics(config: &AppConfig) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(SocketAddr::new(
            config.metrics.host.parse()?,
            config.metrics.port,
        ))
        .install()?;
    info!(port = config.metrics.port, "Metrics exporter started");
    Ok(())
}

fn seed_demo(engine: &FunnelEngine, config: &AppConfig) -> anyhow::Result<()> {
    let partner = config.partner.name.as_str();
    let group = engine.create_group(AudienceGroup::new(partner, "제주 3박4일"))?;

    let mut campaign = Campaign::new(partner, "제주 출발 안내", Channel::Sms)
        .targeting(group)
        .with_policy(ReEntryPolicy::TimeChangeInfoChange)
        .with_stage(
            Stage::new(1, 0, "{{customer_name}}님, {{partner_name}} 예약이 확정되었습니다.")
                .titled("예약 확정"),
        )
        .with_stage(
            Stage::new(2, 1, "출발 준비물 안내: {{link}}")
                .at(9, 0)
                .titled("출발 준비물"),
        )
        .with_stage(
            Stage::new(3, 7, "여행은 즐거우셨나요? 후기를 남겨주세요: {{link}}")
                .at(10, 0)
                .titled("후기 요청"),
        );
    campaign.sender = SenderIdentity {
        name: Some(config.partner.name.clone()),
        phone: Some(config.sms.sender_number.clone()),
        email: None,
    };
    let campaign_id = engine.create_campaign(campaign)?;

    for (id, name, phone) in [
        ("demo-1", "김민지", "010-1234-5678"),
        ("demo-2", "이서준", "010-2345-6789"),
    ] {
        let profile = CustomerProfile::new(id, name)
            .with_phone(phone)
            .with_link("https://example.com/trip/jeju");
        engine.add_member(&group, profile, None)?;
    }

    info!(group_id = %group, campaign_id = %campaign_id, "Demo data seeded");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "funnel_scheduler=info,funnel_engine=info,funnel_channels=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Funnel Scheduler starting up");

    // Load configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(secs) = cli.sweep_interval {
        config.scheduler.sweep_interval_secs = secs;
    }
    if let Some(tz) = cli.timezone {
        config.partner.timezone = tz;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
    }
    config.validate()?;
    let tz = config.partner.tz()?;

    info!(
        node_id = %config.node_id,
        partner = %config.partner.name,
        timezone = %tz,
        sweep_interval_secs = config.scheduler.sweep_interval_secs,
        max_concurrent_dispatches = config.scheduler.max_concurrent_dispatches,
        "Configuration loaded"
    );

    if let Err(e) = start_metrics(&config) {
        error!(error = %e, "Failed to start metrics exporter");
    }

    let engine = FunnelEngine::new(TimeCalculator::new(tz), system_clock());
    if cli.seed_demo {
        seed_demo(&engine, &config)?;
    }

    // Chat and voice-guide have no transport here; their stages fail with
    // ChannelUnavailable and stay due.
    let router = ChannelRouter::new()
        .with_transport(Channel::Sms, Arc::new(SmsProvider::new(config.sms.clone())))
        .with_transport(Channel::Email, Arc::new(EmailProvider::new(config.email.clone())));
    let channels: Vec<&str> = router.channels().iter().map(|c| c.as_str()).collect();
    info!(channels = ?channels, "Transports registered");
    let scheduler = engine.scheduler(
        Arc::new(router),
        &config.partner.name,
        config.scheduler.clone(),
    );

    if cli.once {
        let report = scheduler.sweep().await;
        info!(
            due = report.due,
            dispatched = report.dispatched,
            failed = report.failed,
            "Single sweep complete"
        );
        return Ok(());
    }

    if !config.scheduler.enabled {
        info!("Scheduler disabled by configuration, exiting");
        return Ok(());
    }

    info!("Funnel Scheduler is running");
    scheduler
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await;

    info!("Funnel Scheduler stopped");
    Ok(())
}
