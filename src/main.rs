//! # pipesync CLI
//!
//! Operator interface for the CRM ↔ Pipedrive sync core.
//!
//! ## Usage
//!
//! ```bash
//! pipesync --config ./config/pipesync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pipesync init` | Create the SQLite database and run schema migrations |
//! | `pipesync serve` | Start the HTTP server for the CRM UI |
//! | `pipesync sync` | Run a bulk import from Pipedrive in the foreground |
//! | `pipesync fields <kind>` | Show the discovered custom-field mapping |
//! | `pipesync promote <contact>` | Promote a warm lead to a Pipedrive person |
//! | `pipesync replicate <activity>` | Push a logged activity to Pipedrive |
//! | `pipesync deactivate <contact>` | Deactivate a contact locally and remotely |
//! | `pipesync reactivate <contact>` | Reactivate a contact locally and remotely |
//!
//! ## Examples
//!
//! ```bash
//! pipesync init
//! pipesync sync --full --progress json
//! pipesync promote 6f0c... --user 1b2e...
//! pipesync serve
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;

use pipesync::app::App;
use pipesync::client::PipedriveClient;
use pipesync::config::{self, Config};
use pipesync::discovery;
use pipesync::lifecycle::LifecycleRequest;
use pipesync::logging::{self, LogFormat};
use pipesync::migrate;
use pipesync::progress::ProgressMode;
use pipesync::server;
use pipesync::sqlite_store::SqliteStore;
use pipesync_core::models::EntityKind;
use pipesync_core::progress::{SyncPhase, SyncType};

/// pipesync keeps a local CRM store and a Pipedrive account in step.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/pipesync.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "pipesync",
    about = "Contact, organization, and activity sync between a local CRM and Pipedrive",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/pipesync.toml")]
    config: PathBuf,

    /// Emit log lines as JSON.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the HTTP server.
    ///
    /// Binds to `[server].bind` and serves the sync and CRUD endpoints.
    Serve,

    /// Import Pipedrive persons from the configured filter.
    ///
    /// Incremental by default: records not updated since the last
    /// completed run are skipped. Ctrl-C cancels between records.
    Sync {
        /// Ignore the checkpoint and reprocess every record.
        #[arg(long)]
        full: bool,

        /// Progress output on stderr. Defaults to `human` on a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Print the custom-field mapping discovered from the live schema.
    Fields {
        #[arg(value_enum, default_value = "persons")]
        kind: FieldKind,
    },

    /// Promote a warm lead.
    Promote {
        /// Local contact id.
        contact: String,
        /// Acting local user id.
        #[arg(long)]
        user: String,
    },

    /// Replicate a logged activity.
    Replicate {
        /// Local activity id.
        activity: String,
    },

    /// Deactivate a contact.
    Deactivate {
        contact: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        reason: Option<String>,
        /// Skip the Pipedrive update.
        #[arg(long)]
        local_only: bool,
    },

    /// Reactivate a contact.
    Reactivate {
        contact: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        local_only: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FieldKind {
    Persons,
    Organizations,
}

impl From<FieldKind> for EntityKind {
    fn from(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Persons => EntityKind::Person,
            FieldKind::Organizations => EntityKind::Organization,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    logging::init(cfg.pipedrive.detailed_logging, format);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Serve => {
            println!("pipesync server listening on http://{}", cfg.server.bind);
            server::run_server(&cfg).await?;
        }
        Commands::Sync { full, progress } => {
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            run_sync(cfg, full, mode).await?;
        }
        Commands::Fields { kind } => {
            let client = PipedriveClient::from_config(&cfg.pipedrive)?;
            print_fields(&client, kind.into()).await?;
        }
        Commands::Promote { contact, user } => {
            let app = open_app(cfg).await?;
            let outcome = app.promoter.promote(&contact, &user).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Replicate { activity } => {
            let app = open_app(cfg).await?;
            let outcome = app.replicator.replicate(&activity).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Deactivate {
            contact,
            user,
            reason,
            local_only,
        } => {
            let app = open_app(cfg).await?;
            let request = LifecycleRequest {
                actor_id: user,
                reason,
                sync_remote: !local_only,
            };
            let updated = app.lifecycle.deactivate(&contact, &request).await?;
            println!("{} deactivated", updated.id);
        }
        Commands::Reactivate {
            contact,
            user,
            local_only,
        } => {
            let app = open_app(cfg).await?;
            let request = LifecycleRequest {
                sync_remote: !local_only,
                ..LifecycleRequest::new(user)
            };
            let updated = app.lifecycle.reactivate(&contact, &request).await?;
            println!("{} reactivated", updated.id);
        }
    }

    Ok(())
}

async fn open_app(cfg: Config) -> anyhow::Result<App> {
    let store = SqliteStore::open(&cfg)
        .await
        .with_context(|| format!("opening database {}", cfg.db.path.display()))?;
    App::new(cfg, Arc::new(store))
}

async fn run_sync(cfg: Config, full: bool, mode: ProgressMode) -> anyhow::Result<()> {
    // Fail early with a clear message rather than a 401 from the first page.
    PipedriveClient::from_config(&cfg.pipedrive)?;

    let app = open_app(cfg).await?;
    let sync_type = if full {
        SyncType::Full
    } else {
        SyncType::Incremental
    };
    let sync_id = uuid::Uuid::new_v4().to_string();
    let reporter = mode.reporter();

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling after the current record...");
            on_ctrl_c.cancel();
        }
    });

    let state = app
        .bulk_sync
        .run(&sync_id, sync_type, reporter.as_ref(), &cancel)
        .await;

    println!(
        "sync {}: {:?} ({} processed, {} ok, {} failed, {} skipped)",
        state.sync_id,
        state.status,
        state.processed_records,
        state.succeeded_records,
        state.failed_records,
        state.skipped_records,
    );
    for error in &state.errors {
        println!("  {}", error);
    }
    if let Some(suggestion) = &state.retry_suggestion {
        println!("Suggestion: {}", suggestion);
    }

    match state.status {
        SyncPhase::Failed => anyhow::bail!("sync failed"),
        _ => Ok(()),
    }
}

async fn print_fields(client: &PipedriveClient, kind: EntityKind) -> anyhow::Result<()> {
    let fields = discovery::discover_fields(client, kind).await?;
    for field in &fields {
        println!("{:<40} {:<12} {}", field.key, field.field_type, field.name);
        for option in &field.options {
            println!("    {:>6}  {}", option.id, option.label);
        }
    }

    let mapping = match kind {
        EntityKind::Person => {
            serde_json::to_value(discovery::discover_field_mapping(client).await?)?
        }
        EntityKind::Organization => {
            serde_json::to_value(discovery::discover_organization_mapping(client).await?)?
        }
    };
    println!();
    println!("Mapping:");
    println!("{}", serde_json::to_string_pretty(&mapping)?);
    Ok(())
}
