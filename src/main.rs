use std::sync::Arc;

use eyre::WrapErr;
use tokio::sync::watch;
use tokio::task::JoinSet;

use bridge_relayer::api::{self, AppState};
use bridge_relayer::chain::{ChainSet, EvmChain};
use bridge_relayer::config::{Config, LogFormat};
use bridge_relayer::db::{self, EventStore, PgEventStore};
use bridge_relayer::executor::ActionExecutor;
use bridge_relayer::metrics;
use bridge_relayer::observer::ObserverManager;
use bridge_relayer::reconcile::ReconciliationSweep;
use bridge_relayer::relay::{FinalityTracker, RelayEngine, RelayGuard};
use bridge_relayer::retry::RetryScheduler;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    let config = Config::load()?;
    init_logging(config.log_format);

    tracing::info!(
        source = %config.source.key,
        source_chain_id = config.source.chain_id,
        destination = %config.destination.key,
        destination_chain_id = config.destination.chain_id,
        "Starting bridge relayer"
    );
    tracing::debug!(?config, "Configuration loaded");

    let pool = db::create_pool(&config.database.url, config.database.max_connections).await?;
    tracing::info!("Database connected");
    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");
    let store: Arc<dyn EventStore> = Arc::new(PgEventStore::new(pool));

    let relay = &config.relay;
    let chains = ChainSet {
        source: EvmChain::new(&config.source, relay.rpc_timeout(), relay.inclusion_timeout())
            .wrap_err("Failed to set up source chain")?
            .into_handle(config.source.confirmation_depth),
        destination: EvmChain::new(
            &config.destination,
            relay.rpc_timeout(),
            relay.inclusion_timeout(),
        )
        .wrap_err("Failed to set up destination chain")?
        .into_handle(config.destination.confirmation_depth),
    };
    let policy = relay.retry_policy();

    let observers = ObserverManager::new(
        &chains,
        store.clone(),
        relay.max_block_range,
        (config.source.start_block, config.destination.start_block),
    );
    let engine = RelayEngine::new(
        store.clone(),
        chains.clone(),
        ActionExecutor::new(chains.clone(), relay.executor_timeout()),
        policy.clone(),
        RelayGuard::new(relay.supported_assets.clone(), relay.max_relay_amount),
        relay.worker_concurrency,
        relay.batch_size,
    );
    let finality = FinalityTracker::new(
        store.clone(),
        chains.clone(),
        policy.clone(),
        relay.submitting_timeout(),
        relay.batch_size,
    );
    let scheduler = RetryScheduler::new(store.clone(), policy.clone(), relay.batch_size);
    let sweep = ReconciliationSweep::new(
        store.clone(),
        chains,
        relay.submitting_timeout(),
        relay.batch_size,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let api_state = AppState::new(store.clone(), config.api.admin_token.clone());
    let bind_address = config.api.bind_address.clone();
    let port = config.api.port;
    tokio::spawn(async move {
        if let Err(e) = api::start_api_server(&bind_address, port, api_state).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    tracing::info!("Components initialized, starting processing");
    metrics::UP.set(1.0);

    let interval = relay.poll_interval();
    let mut tasks = JoinSet::new();
    tasks.spawn(observers.run(interval, policy.clone(), shutdown_rx.clone()));
    tasks.spawn(engine.run(interval, shutdown_rx.clone()));
    tasks.spawn(finality.run(interval, shutdown_rx.clone()));
    tasks.spawn(scheduler.run(interval, shutdown_rx.clone()));
    tasks.spawn(sweep.run(relay.reconcile_interval(), policy, shutdown_rx));

    let mut result = Ok(());
    while let Some(done) = tasks.join_next().await {
        match done {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Relay component stopped with error");
                tasks.abort_all();
                result = Err(e);
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                tracing::error!(error = %e, "Relay component panicked");
                tasks.abort_all();
                result = Err(eyre::eyre!("relay component panicked: {}", e));
            }
        }
    }

    metrics::UP.set(0.0);
    tracing::info!("Bridge relayer stopped");
    result
}

/// Initialize tracing/logging with structured output
fn init_logging(format: LogFormat) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bridge_relayer=debug"));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init(),
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
