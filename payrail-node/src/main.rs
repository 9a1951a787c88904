use anyhow::Result;
use clap::{Parser, Subcommand};
use payrail_config::Settings;
use payrail_node::Service;

#[derive(Parser)]
#[command(name = "payrail-node", version, about = "payrail settlement services")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// HTTP API facade (health, readiness, invoice creation)
    Api,
    /// Exchange deposit poller and matcher
    Poller,
    /// Webhook delivery worker
    WebhookWorker,
    /// Every service in a single process
    All,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    payrail_node::init_tracing();
    let settings = Settings::from_env()?;
    let _sentry = payrail_node::init_sentry(&settings);
    let service = match cli.command {
        Commands::Api => Service::Api,
        Commands::Poller => Service::Poller,
        Commands::WebhookWorker => Service::WebhookWorker,
        Commands::All => Service::All,
    };
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(payrail_node::run(settings, service))
}
