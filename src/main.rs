use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};

use outreach_agent::campaign::{
    CampaignController, CampaignScheduler, ControllerSettings, spawn_campaign_scheduler,
};
use outreach_agent::config::{CampaignConfig, EmailConfig, LlmConfig, SenderProfile};
use outreach_agent::contacts::{NewContact, import_contacts};
use outreach_agent::content::LlmContentGenerator;
use outreach_agent::llm::create_provider;
use outreach_agent::mail::EmailTransport;
use outreach_agent::store::{ContactStore, LibSqlBackend};

enum Command {
    Run,
    Once,
    Import(PathBuf),
}

fn parse_args() -> anyhow::Result<Command> {
    let mut args = std::env::args().skip(1);
    let command = match args.next().as_deref() {
        None => Command::Run,
        Some("--once") => Command::Once,
        Some("--import") => {
            let path = args.next().context("--import needs a path to a contacts JSON file")?;
            Command::Import(PathBuf::from(path))
        }
        Some(other) => bail!("unknown argument: {other} (expected --once or --import <file>)"),
    };
    if let Some(extra) = args.next() {
        bail!("unexpected argument: {extra}");
    }
    Ok(command)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let command = parse_args()?;
    let campaign = CampaignConfig::from_env()?;
    campaign.validate()?;

    eprintln!("📬 Outreach Agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", campaign.db_path.display());

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn ContactStore> = Arc::new(
        LibSqlBackend::new_local(&campaign.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", campaign.db_path.display()))?,
    );

    if let Command::Import(path) = &command {
        return import_file(store.as_ref(), path).await;
    }

    // ── Collaborators ────────────────────────────────────────────────────
    let llm_config = LlmConfig::from_env()?;
    let llm = create_provider(&llm_config)?;
    let generator = Arc::new(LlmContentGenerator::new(llm, SenderProfile::from_env()));

    let email_config = EmailConfig::from_env()?;
    eprintln!("   Mailbox: {} via {}", email_config.username, email_config.imap_host);
    let transport = Arc::new(EmailTransport::new(email_config));

    let controller = Arc::new(CampaignController::new(
        Arc::clone(&store),
        generator,
        transport,
        ControllerSettings::from(&campaign),
    ));
    let scheduler = Arc::new(CampaignScheduler::new(controller, campaign.max_concurrent));

    if let Command::Once = command {
        let summary = scheduler.run_tick().await?;
        eprintln!(
            "   Tick: {} contacts, {} sent, {} replied, {} exhausted, {} failed",
            summary.contacts, summary.sent, summary.replied, summary.exhausted, summary.failed
        );
        return Ok(());
    }

    eprintln!(
        "   Tick every {}s, max drip step {}. Ctrl-C to stop.\n",
        campaign.tick_interval.as_secs(),
        campaign.max_drip_step
    );
    let (handle, shutdown) = spawn_campaign_scheduler(scheduler, campaign.tick_interval);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested; finishing current tick");
    shutdown.shutdown();
    handle.await?;

    Ok(())
}

/// Insert contacts from a JSON array of `{name, company_name, email, company_url?}`.
async fn import_file(store: &dyn ContactStore, path: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let contacts: Vec<NewContact> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array of contacts", path.display()))?;

    let summary = import_contacts(store, &contacts).await?;
    eprintln!(
        "   Imported {}, skipped {} existing, rejected {}",
        summary.imported, summary.skipped, summary.rejected
    );
    Ok(())
}
