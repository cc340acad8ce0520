//! # Leadflow: outbound sequence engine
//!
//! Usage:
//!   leadflow                              # Scheduler loop + gateway (same as `serve`)
//!   leadflow serve --port 8080            # Custom gateway port
//!   leadflow tick                         # One scheduler pass, print the report
//!   leadflow enroll <lead> <campaign>     # Enroll a lead
//!   leadflow failed                       # List failed enrollments
//!   leadflow reset <enrollment>           # Put a failed enrollment back in the queue
//!   leadflow init-config                  # Write ~/.leadflow/config.toml

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use leadflow_channels::{CallDispatcher, EmailDispatcher, SmtpMailer, VapiClient};
use leadflow_core::{CallRegistry, LeadflowConfig, TrackingStore};
use leadflow_db::SqliteBackend;
use leadflow_gateway::{AppState, WebhookReconciler};
use leadflow_scheduler::{SequenceScheduler, spawn_scheduler};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "leadflow",
    version,
    about = "📬 Leadflow: multi-channel outbound sequences with call and email tracking"
)]
struct Cli {
    /// Config file (default: $LEADFLOW_CONFIG or ~/.leadflow/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler loop and the HTTP gateway
    Serve {
        /// Override gateway.port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run a single scheduler pass
    Tick,
    /// Enroll a lead in a campaign
    Enroll { lead_id: String, campaign_id: String },
    /// Reset a failed enrollment
    Reset { enrollment_id: String },
    /// List failed enrollments
    Failed,
    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Everything the subcommands share.
struct Engine {
    store: Arc<TrackingStore>,
    registry: Arc<CallRegistry>,
    scheduler: Arc<SequenceScheduler>,
}

impl Engine {
    fn build(config: &LeadflowConfig) -> Result<Self> {
        let db_path = &config.database.path;
        let db = Arc::new(
            SqliteBackend::open(db_path).with_context(|| format!("opening database {db_path}"))?,
        );

        let store = Arc::new(TrackingStore::from_config(db.clone(), config));
        let registry = Arc::new(CallRegistry::new(config.cache.ttl(), config.cache.max_entries));
        let public_url = &config.gateway.public_url;

        let mailer = Arc::new(SmtpMailer::new(&config.smtp).context("building SMTP mailer")?);
        let email = EmailDispatcher::new(mailer, store.clone(), public_url)
            .with_retry_policy(config.retry.smtp_policy());

        let voice = Arc::new(VapiClient::new(&config.voice));
        let calls = CallDispatcher::new(
            voice,
            store.clone(),
            registry.clone(),
            public_url,
            &config.voice.country_code,
        )
        .with_retry_policy(config.retry.backend_policy());

        let scheduler = SequenceScheduler::new(
            db,
            store.clone(),
            email,
            calls,
            config.scheduler.clone(),
        )
        .with_retry_policy(config.retry.backend_policy());

        Ok(Self { store, registry, scheduler: Arc::new(scheduler) })
    }
}

fn load_config(path: Option<&str>) -> Result<LeadflowConfig> {
    let config = match path {
        Some(p) => {
            let expanded = PathBuf::from(shellexpand::tilde(p).to_string());
            LeadflowConfig::load_from(&expanded)?
        }
        None => LeadflowConfig::load()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "leadflow=debug,leadflow_core=debug,leadflow_db=debug,leadflow_channels=debug,\
         leadflow_scheduler=debug,leadflow_gateway=debug,tower_http=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let command = cli.command.unwrap_or(Command::Serve { port: None });

    if let Command::InitConfig { force } = command {
        let path = cli
            .config
            .as_deref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()))
            .unwrap_or_else(LeadflowConfig::default_path);
        if path.exists() && !force {
            println!("⚠️  {} already exists (use --force to overwrite)", path.display());
            return Ok(());
        }
        LeadflowConfig::default().save_to(&path)?;
        println!("✅ Wrote {}", path.display());
        return Ok(());
    }

    let mut config = load_config(cli.config.as_deref())?;
    let engine = Engine::build(&config)?;

    match command {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.gateway.port = port;
            }
            let interval = Duration::from_secs(config.scheduler.interval_secs.max(1));
            let _loop = spawn_scheduler(engine.scheduler.clone(), interval);

            let state = AppState {
                reconciler: Arc::new(WebhookReconciler::new(
                    engine.store.clone(),
                    engine.registry.clone(),
                )),
                store: engine.store,
                scheduler: engine.scheduler,
                start_time: std::time::Instant::now(),
            };
            leadflow_gateway::start(&config.gateway, state).await?;
        }
        Command::Tick => {
            let report = engine.scheduler.tick().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Enroll { lead_id, campaign_id } => {
            let enrollment = engine.scheduler.enroll(&lead_id, &campaign_id).await?;
            println!("✅ Enrolled {lead_id} in {campaign_id} as {}", enrollment.id);
        }
        Command::Reset { enrollment_id } => {
            let enrollment = engine.scheduler.reset_enrollment(&enrollment_id).await?;
            println!(
                "♻️ {} reset to step {} (due now)",
                enrollment.id, enrollment.current_step_index
            );
        }
        Command::Failed => {
            let failed = engine.scheduler.failed_enrollments().await?;
            if failed.is_empty() {
                println!("No failed enrollments.");
            }
            for e in failed {
                println!(
                    "{}  lead={}  campaign={}  step={}  error={}",
                    e.id,
                    e.lead_id,
                    e.campaign_id,
                    e.current_step_index,
                    e.last_error.as_deref().unwrap_or("-")
                );
            }
        }
        Command::InitConfig { .. } => {}
    }
    Ok(())
}
