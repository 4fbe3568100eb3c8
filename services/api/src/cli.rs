use crate::demo::{seed_demo_clients, DemoArgs};
use crate::infra::SqliteStore;
use crate::server;
use clap::{Args, Parser, Subcommand};
use lead_sync::config::AppConfig;
use lead_sync::error::AppError;
use lead_sync::telemetry::{self, LogTarget};
use lead_sync::workflows::planning::{ClientId, SyncRun};
use serde_json::json;

#[derive(Parser, Debug)]
#[command(
    name = "Planning Lead Sync",
    about = "Pull planning applications for each client and deliver them to the client's CRM",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Run a sync now and print the run summary as JSON
    Sync(SyncArgs),
    /// Check a client's CRM credentials
    TestConnection(TestConnectionArgs),
    /// Seed demo clients into an empty state database
    Demo(DemoArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub(crate) struct SyncArgs {
    /// Client to sync
    #[arg(long)]
    pub(crate) client: Option<String>,
    /// Sync every active client in turn
    #[arg(long)]
    pub(crate) all: bool,
}

#[derive(Args, Debug)]
pub(crate) struct TestConnectionArgs {
    /// Client whose CRM credentials are checked
    #[arg(long)]
    pub(crate) client: String,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Sync(args) => run_sync(args).await,
        Command::TestConnection(args) => run_test_connection(args).await,
        Command::Demo(args) => run_demo(args),
    }
}

fn one_shot_config() -> Result<AppConfig, AppError> {
    let config = AppConfig::load()?;
    telemetry::init_with_target(&config.telemetry, LogTarget::Stderr)?;
    Ok(config)
}

fn print_json(value: &serde_json::Value) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::Io(std::io::Error::other(err)))?;
    println!("{rendered}");
    Ok(())
}

async fn run_sync(args: SyncArgs) -> Result<(), AppError> {
    let config = one_shot_config()?;
    let store = SqliteStore::open(&config.storage.state_path)?;
    let service = server::build_service(&config, store)?;

    let runs: Vec<SyncRun> = match args.client {
        Some(client) => {
            let id = ClientId(client);
            match service.run_client_sync(&id).await {
                Some(run) => vec![run],
                None => return Err(AppError::UnknownClient(id.0)),
            }
        }
        None => service.run_all().await?,
    };

    print_json(&json!(runs))
}

async fn run_test_connection(args: TestConnectionArgs) -> Result<(), AppError> {
    let config = one_shot_config()?;
    let store = SqliteStore::open(&config.storage.state_path)?;
    let service = server::build_service(&config, store)?;

    let id = ClientId(args.client);
    match service.test_connection(&id).await? {
        Some(connected) => print_json(&json!({ "client_id": id, "connected": connected })),
        None => Err(AppError::UnknownClient(id.0)),
    }
}

fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let config = AppConfig::load()?;
    let path = args.state_path.unwrap_or(config.storage.state_path);
    let store = SqliteStore::open(&path)?;
    let seeded = seed_demo_clients(&store)?;
    if seeded == 0 {
        println!("{} already has clients; nothing seeded", path.display());
    } else {
        println!("seeded {seeded} demo clients into {}", path.display());
    }
    Ok(())
}
