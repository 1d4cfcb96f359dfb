use {
    chrono::Utc,
    clap::{Args, Parser, Subcommand},
    dotenvy::dotenv,
    relay_server::services::{healthcheck::check_healthcheck, mail_worker::WorkerOptions},
    std::{
        path::{Path, PathBuf},
        process::ExitCode,
    },
    tokio::sync::broadcast,
    tracing::{error, info, warn},
    tracing_subscriber::EnvFilter,
};

#[derive(Parser)]
#[command(name = "relay-server")]
#[command(about = "Email and phone relaying service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log verbosity; -vv also logs healthcheck passes
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the inbound-mail queue and relay messages until stopped
    RunWorker(WorkerArgs),
    /// Check the worker's healthcheck document for staleness
    CheckHealth {
        path: PathBuf,
        /// Maximum healthcheck age in seconds
        #[arg(long, default_value_t = 120)]
        max_age: u64,
    },
    /// Serve the telephony webhooks and the phone verification API
    Serve,
}

#[derive(Args)]
struct WorkerArgs {
    /// Messages per poll, 1 to 10
    #[arg(long, default_value_t = 10)]
    batch_size: i32,

    /// Long-poll wait per receive call
    #[arg(long, default_value_t = 20)]
    wait_seconds: i32,

    /// How long a received message stays hidden from other workers
    #[arg(long, default_value_t = 120)]
    visibility_seconds: i32,

    #[arg(long, default_value = "/tmp/relay-worker-healthcheck.json")]
    healthcheck_path: PathBuf,

    /// Delete permanently failed messages instead of leaving them for the
    /// queue's dead-letter policy
    #[arg(long)]
    delete_failed_messages: bool,

    /// Exit cleanly after this many seconds
    #[arg(long)]
    max_seconds: Option<u64>,

    /// Overrides QUEUE_URL
    #[arg(long)]
    queue_url: Option<String>,

    /// Overrides REGION
    #[arg(long)]
    region: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckHealth { path, max_age } => {
            init_logging(cli.verbose, None);
            check_health(&path, max_age, cli.verbose)
        }
        Commands::RunWorker(args) => match relay_server::config::get_configuration() {
            Ok(config) => {
                init_logging(cli.verbose, Some(&config.log_level));
                run_worker(config, args).await
            }
            Err(e) => invalid_configuration(cli.verbose, e),
        },
        Commands::Serve => match relay_server::config::get_configuration() {
            Ok(config) => {
                init_logging(cli.verbose, Some(&config.log_level));
                serve(config).await
            }
            Err(e) => invalid_configuration(cli.verbose, e),
        },
    }
}

fn init_logging(verbose: u8, configured: Option<&str>) {
    let default_filter = match (verbose, configured) {
        (0, Some(level)) => level.to_owned(),
        (0, None) => "warn,relay_server=info".to_owned(),
        (1, _) => "info".to_owned(),
        _ => "debug".to_owned(),
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn invalid_configuration(verbose: u8, e: relay_server::RelayServerError) -> ExitCode {
    init_logging(verbose, None);
    error!("Invalid configuration: {e}");
    ExitCode::FAILURE
}

fn check_health(path: &Path, max_age: u64, verbose: u8) -> ExitCode {
    match check_healthcheck(path, chrono::Duration::seconds(max_age as i64), Utc::now()) {
        Ok(document) => {
            if verbose >= 2 {
                warn!(
                    "Healthcheck passed: cycle {}, {} messages, {} failed",
                    document.cycles, document.total_messages, document.failed_messages
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Healthcheck failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn interrupt_channel() -> broadcast::Receiver<()> {
    let (signal_tx, shutdown) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = signal_tx.send(());
        }
    });
    shutdown
}

async fn run_worker(mut config: relay_server::config::Configuration, args: WorkerArgs) -> ExitCode {
    if let Some(queue_url) = args.queue_url {
        config.queue_url = queue_url;
    }
    if let Some(region) = args.region {
        config.region = region;
    }

    let options = WorkerOptions {
        queue_name: config.queue_name().to_owned(),
        batch_size: args.batch_size,
        wait_seconds: args.wait_seconds,
        visibility_seconds: args.visibility_seconds,
        healthcheck_path: args.healthcheck_path,
        delete_failed_messages: args.delete_failed_messages,
        max_seconds: args.max_seconds,
    };

    match relay_server::run_worker(config, options, interrupt_channel()).await {
        Ok(reason) => {
            info!("Worker stopped cleanly: {reason:?}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Worker failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: relay_server::config::Configuration) -> ExitCode {
    match relay_server::bootstrap(interrupt_channel(), config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server failed: {e}");
            ExitCode::FAILURE
        }
    }
}
