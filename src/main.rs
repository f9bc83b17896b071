use anyhow::Context;
use clap::Parser;
use railgun::{CheckpointStore, Config, Error, FileCheckpointStore, Replicator, Shutdown};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "railgun", version)]
#[command(about = "Streams PostgreSQL logical replication changes to sinks", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "railgun.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, help = "Drop the configured replication slot and exit")]
    drop_slot: bool,

    #[arg(long, help = "Delete the slot's checkpoint and exit")]
    reset_checkpoint: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e
                .downcast_ref::<Error>()
                .map(Error::exit_code)
                .unwrap_or(1);
            error!("{:#}", e);
            ExitCode::from(code)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    info!("Starting railgun");
    info!("Loading configuration from {:?}", args.config);

    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;

    info!(
        postgres_host = %config.postgres.host,
        postgres_port = %config.postgres.port,
        postgres_database = %config.postgres.database,
        postgres_publication = %config.postgres.publication,
        slot = %config.postgres.slot_name,
        buffer_capacity = config.pipeline.buffer_capacity,
        sinks = config.sinks.len(),
        "Configuration summary"
    );

    if args.drop_slot {
        railgun::replicator::drop_slot(&config)
            .await
            .context("Failed to drop replication slot")?;
        return Ok(());
    }

    if args.reset_checkpoint {
        let store = FileCheckpointStore::open(&config.checkpoint.directory).await?;
        store.reset(&config.postgres.slot_name).await?;
        info!(slot = %config.postgres.slot_name, "Checkpoint reset");
        return Ok(());
    }

    let replicator = Replicator::from_config(config).await?;

    let shutdown = Shutdown::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let summary = replicator.run(&shutdown).await?;
    info!(
        transactions = summary.transactions_delivered,
        events = summary.events_delivered,
        last_confirmed = ?summary.last_confirmed.map(|p| p.to_string()),
        "Replication finished"
    );
    Ok(())
}

/// First signal: graceful shutdown. Second: immediate.
async fn watch_signals(shutdown: Shutdown) {
    if wait_for_signal().await.is_err() {
        return;
    }
    info!("Shutdown signal received, draining buffered transactions");
    shutdown.graceful();

    if wait_for_signal().await.is_err() {
        return;
    }
    warn!("Second shutdown signal received, stopping immediately");
    shutdown.immediate();
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Logs go to stderr; stdout belongs to the stdout sink.
fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("railgun=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("railgun=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
