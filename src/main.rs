use clap::Parser;
use ploy_failsafe::cli::{self, Cli, Commands};
use ploy_failsafe::config::LoggingConfig;
use ploy_failsafe::coordination::shutdown::install_signal_handlers;
use ploy_failsafe::error::Result;
use ploy_failsafe::{
    run_startup, AppConfig, Failsafe, GracefulShutdown, MemoryStore, PositionSource,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;
    config.validate()?;

    match &cli.command {
        Commands::Run { memory } => {
            init_logging(&config.logging);
            run(config, *memory).await?;
        }
        Commands::Status => {
            init_logging_simple();
            cli::show_status(&config).await?;
        }
        Commands::Trip { note } => {
            init_logging_simple();
            cli::trip(&config, note).await?;
        }
        Commands::Reset { operator, reason } => {
            init_logging_simple();
            cli::reset(&config, operator, reason).await?;
        }
        Commands::Intents { status } => {
            init_logging_simple();
            cli::list_intents(&config, status).await?;
        }
        Commands::ReconcileIntent { id, resolution } => {
            init_logging_simple();
            cli::reconcile_intent(&config, *id, resolution).await?;
        }
        Commands::PruneIntents { days } => {
            init_logging_simple();
            cli::prune_intents(&config, *days).await?;
        }
    }

    Ok(())
}

async fn run(config: AppConfig, memory: bool) -> Result<()> {
    info!(mode = %config.trading.mode, memory, "Starting ploy-failsafe");

    let shutdown = Arc::new(GracefulShutdown::with_defaults());
    install_signal_handlers(shutdown.clone());
    let mut shutdown_rx = shutdown.subscribe();

    let (failsafe, db_positions): (Failsafe, Arc<dyn PositionSource>) = if memory {
        let store = Arc::new(MemoryStore::new());
        let fs = Failsafe::builder(config.clone())
            .orchestrator(shutdown.clone())
            .build(store.clone());
        (fs, store as Arc<dyn PositionSource>)
    } else {
        let store = cli::connect(&config).await?;
        let fs = Failsafe::builder(config.clone())
            .orchestrator(shutdown.clone())
            .build(store.clone());
        (fs, store as Arc<dyn PositionSource>)
    };

    // No oracle feed in the standalone supervisor; an embedding engine passes
    // its own `TickFeed` to `Failsafe::init`.
    failsafe.init(None).await?;

    let report = run_startup(&failsafe, db_positions.as_ref(), None).await?;
    if !report.is_clean() {
        warn!(
            report = %serde_json::to_string(&report).unwrap_or_default(),
            "Startup finished with findings"
        );
    }
    failsafe.start_background();

    let mut status_ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = status_ticker.tick() => {
                let status = failsafe.get_state().await;
                info!(
                    can_trade = status.can_trade,
                    breaker = %status.breaker.state,
                    role = %status.lock.role,
                    gate_disabled = status.quality_gate.disabled,
                    "Failsafe status"
                );
            }
            signal = shutdown_rx.recv() => {
                match signal {
                    Ok(sig) => info!("Shutdown signal received: {}", sig),
                    Err(e) => warn!("Shutdown channel error: {}", e),
                }
                break;
            }
        }
    }

    if let Err(e) = shutdown.execute(&failsafe).await {
        error!("Shutdown incomplete: {}", e);
    }
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},ploy_failsafe=debug,sqlx=warn", logging.level))
    });

    let log_dir = std::env::var("FAILSAFE_LOG_DIR")
        .ok()
        .or_else(|| logging.dir.clone());

    // `rolling::daily` panics if it cannot create the file, so check writability first.
    let file_layer = log_dir.as_ref().and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "Warning: Could not create log directory {} ({}), file logging disabled",
                dir, e
            );
            return None;
        }
        let write_test = std::path::Path::new(dir).join(".failsafe_write_test");
        match std::fs::OpenOptions::new().create(true).append(true).open(&write_test) {
            Ok(_) => {
                let _ = std::fs::remove_file(&write_test);
                let file_appender = tracing_appender::rolling::daily(dir, "failsafe.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                // Lives for the whole process.
                Box::leak(Box::new(guard));
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    dir, e
                );
                None
            }
        }
    });

    let (json_layer, text_layer) = if logging.json {
        (Some(tracing_subscriber::fmt::layer().json().with_target(true)), None)
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
        )
    };

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .init();

    if let (true, Some(dir)) = (file_logging_enabled, log_dir) {
        eprintln!("Logging to: {}/failsafe.log", dir);
    }
}

fn init_logging_simple() {
    // Minimal logging for operator commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
