use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use chat_context::server::{self, AppState};
use chat_context::settings::{resolve_effective_settings, ContextSettings, SettingsOverrides};
use chat_context::storage::{MemoryStore, SqliteContextStore};
use chat_context::{ContextService, SessionId};

#[derive(Debug, Parser)]
#[command(name = "chat_context")]
#[command(about = "Conversation context assembly and caching service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Overrides CHAT_CONTEXT_MESSAGES
    #[arg(long, global = true)]
    context_messages: Option<usize>,

    /// Overrides CHAT_CONTEXT_ASSISTANT_ROLE
    #[arg(long, global = true)]
    assistant_role: Option<String>,

    /// SQLite URL; defaults to the XDG data dir
    #[arg(long, global = true)]
    database_url: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Serve {
        #[arg(long, default_value = "127.0.0.1:7171")]
        listen: String,
        /// Expose Prometheus metrics on this address
        #[arg(long)]
        metrics_listen: Option<String>,
        /// Keep everything in memory
        #[arg(long)]
        ephemeral: bool,
    },
    /// Print the assembled context for a session
    Show {
        session: SessionId,
        /// Print the cached document instead of the decoded view
        #[arg(long)]
        raw: bool,
    },
    /// Print the estimated token count for a session
    Tokens { session: SessionId },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cli_overrides = SettingsOverrides {
        context_messages: cli.context_messages,
        assistant_role: cli.assistant_role.clone(),
    };
    let settings = resolve_effective_settings(&ContextSettings::default(), &SettingsOverrides::from_env()?, &cli_overrides)?;

    match cli.command {
        Commands::Serve { listen, metrics_listen, ephemeral } => {
            let addr: SocketAddr = listen.parse()?;
            if let Some(metrics_addr) = metrics_listen {
                install_metrics_exporter(metrics_addr.parse()?);
            }
            let service = if ephemeral {
                ContextService::new(Arc::new(MemoryStore::new()), settings)?
            } else {
                let store = SqliteContextStore::initialize(cli.database_url).await?;
                ContextService::new(Arc::new(store), settings)?
            };
            info!(ephemeral, "context service ready");
            server::serve(addr, AppState { service: Arc::new(service) }).await?;
        }
        Commands::Show { session, raw } => {
            let service = open_service(cli.database_url, settings).await?;
            if raw {
                println!("{}", service.get_context_document(session).await?);
            } else {
                let data = service.try_get_context_data(session).await?;
                println!("{}", serde_json::to_string_pretty(&data)?);
            }
        }
        Commands::Tokens { session } => {
            let service = open_service(cli.database_url, settings).await?;
            let data = service.try_get_context_data(session).await?;
            let b = data.token_breakdown();
            println!("messages:        {}", b.messages);
            println!("files:           {}", b.files);
            println!("assistant role:  {}", b.assistant_role);
            println!("total:           {}", b.total);
        }
    }
    Ok(())
}

async fn open_service(database_url: Option<String>, settings: ContextSettings) -> anyhow::Result<ContextService> {
    let store = SqliteContextStore::initialize(database_url).await?;
    Ok(ContextService::new(Arc::new(store), settings)?)
}

fn install_metrics_exporter(addr: SocketAddr) {
    use metrics_exporter_prometheus::PrometheusBuilder;
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => info!(%addr, "metrics exporter listening"),
        Err(e) => warn!("Failed to install Prometheus exporter: {}", e),
    }
}
