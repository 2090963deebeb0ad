use std::sync::Arc;
use std::time::Instant;

use coordinator::api::{self, AppState};
use coordinator::audit::{AuditSink, CompositeAuditSink, TracingAuditSink, TracingSettlementSink};
use coordinator::config::Config;
use coordinator::db::{self, MemoryStore, PersistenceStore, PgStore};
use coordinator::executor::RelayExecutor;
use coordinator::keys::EcdsaVerifier;
use coordinator::metrics::{self, MetricsAuditSink};
use coordinator::processor::TransactionProcessor;
use coordinator::registry::BridgeRegistry;
use coordinator::tokens::TokenRegistry;
use coordinator::transport::{AttestationTransport, NoopTransport, WebhookTransport};
use coordinator::validators::{LivenessMonitor, ValidatorSet};
use coordinator::TransactionCoordinator;

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
    init_logging(config.json_logs);

    tracing::info!("Starting bridge coordinator");
    tracing::info!(
        api = ?config.api,
        poll_interval_ms = config.processor.poll_interval_ms,
        target_relays = config.transport.target_relays.len(),
        validator_endpoints = config.transport.validator_endpoints.len(),
        "Configuration loaded"
    );

    let store: Arc<dyn PersistenceStore> = match &config.database {
        Some(database) => {
            let pool = db::create_pool(&database.url).await?;
            tracing::info!("Database connected");
            db::run_migrations(&pool).await?;
            tracing::info!("Database migrations complete");
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store (state is lost on exit)");
            Arc::new(MemoryStore::new())
        }
    };

    let settings = config.settings.clone();
    let validators = Arc::new(ValidatorSet::new(
        store.clone(),
        Arc::new(EcdsaVerifier),
        settings.validators.clone(),
    ));
    let bridges = Arc::new(BridgeRegistry::new(store.clone(), validators.clone()));
    let tokens = Arc::new(TokenRegistry::new(store.clone()));

    let transport: Arc<dyn AttestationTransport> = if config.transport.validator_endpoints.is_empty()
    {
        tracing::warn!("No VALIDATOR_ENDPOINTS configured, validators must poll for requests");
        Arc::new(NoopTransport)
    } else {
        Arc::new(WebhookTransport::new(
            config.transport.validator_endpoints.clone(),
            settings.retry.clone(),
            settings.timeouts.external_call_timeout,
        )?)
    };
    let executor = Arc::new(RelayExecutor::new(
        config.transport.target_relays.clone(),
        settings.timeouts.external_call_timeout,
    )?);
    let audit: Arc<dyn AuditSink> = Arc::new(CompositeAuditSink::new(vec![
        Arc::new(TracingAuditSink),
        Arc::new(MetricsAuditSink),
    ]));

    let coordinator = Arc::new(
        TransactionCoordinator::new(
            store.clone(),
            bridges.clone(),
            validators.clone(),
            tokens.clone(),
            executor,
            settings,
        )
        .with_transport(transport)
        .with_audit(audit)
        .with_settlement(Arc::new(TracingSettlementSink)),
    );

    // Create shutdown channels
    let (monitor_tx, monitor_rx) = tokio::sync::mpsc::channel::<()>(1);
    let (processor_tx, processor_rx) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = monitor_tx.send(()).await;
        let _ = processor_tx.send(()).await;
    });

    let monitor = LivenessMonitor::new(validators.clone());
    let mut processor = TransactionProcessor::new(
        coordinator.clone(),
        bridges.clone(),
        validators.clone(),
        config.processor.clone(),
    );
    let state = AppState {
        coordinator,
        bridges,
        validators,
        tokens,
        store,
        admin_token: config.api.admin_token.as_deref().map(Arc::from),
        started_at: Instant::now(),
    };

    tracing::info!("Components initialized, starting processing");

    tokio::select! {
        result = monitor.run(monitor_rx) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Liveness monitor error");
            }
        }
        result = processor.run(processor_rx) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Transaction processor error");
            }
        }
        result = api::start_server(&config.api.bind_address, config.api.port, state) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "API server error");
            }
        }
    }

    metrics::UP.set(0.0);
    tracing::info!("Bridge coordinator stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging(json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,coordinator=debug,bridge_coordinator=debug"));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
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
