use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use clipsync::config::Config;
use clipsync::context::SyncContext;
use clipsync::messaging::{MessageBus, MessageRouter, MESSAGE_TIMEOUT};
use clipsync::routes::{self, AppState};
use clipsync::scheduler::Trigger;
use clipsync::storage::{KeyValueStore, SqliteStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("🚀 clipsync starting...");
    tracing::info!("API: {}", config.api_base_url);

    // Open local storage
    let storage: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(&config.storage_db_file)?);
    tracing::info!("✅ Storage opened at {}", config.storage_db_file.display());

    let context = SyncContext::new(config.clone(), storage)?;

    // Check the stored session; refreshes it if it is about to expire
    tracing::info!("Checking stored session...");
    match context.auth.ensure_valid().await {
        Some(credential) => {
            let who = credential
                .profile
                .as_ref()
                .map(|p| p.email.clone())
                .filter(|email| !email.is_empty())
                .unwrap_or_else(|| "unknown user".to_string());
            tracing::info!("✅ Authenticated as {}", who);
        }
        None => {
            tracing::warn!("Not authenticated; clippings will be queued until a UI surface logs in");
        }
    }

    match context.queue.len().await {
        Ok(0) => {}
        Ok(count) => tracing::info!("{} clippings waiting to sync", count),
        Err(e) => tracing::warn!("Could not read pending queue: {:#}", e),
    }

    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(context.scheduler.clone().run(shutdown.clone()));
    context.scheduler.trigger(Trigger::Startup);

    let router = Arc::new(MessageRouter::new(context.clone()));
    let bus = Arc::new(MessageBus::spawn(router, MESSAGE_TIMEOUT));
    tracing::info!("✅ Message bus ready");

    let app = routes::build_app(AppState {
        context: context.clone(),
        bus,
        bridge_api_key: config.bridge_api_key.clone(),
    });

    // Bind to configured host and port
    let addr = format!("{}:{}", config.bridge_host, config.bridge_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    print_startup_banner(&config);

    tracing::info!("🚀 Bridge listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    if let Err(e) = scheduler_task.await {
        tracing::error!("Background sync task failed: {}", e);
    }

    tracing::info!("👋 Shutdown complete");

    Ok(())
}

/// Print startup banner
fn print_startup_banner(config: &Config) {
    let banner = r#"
╔═══════════════════════════════════════════════════════════╗
║                                                           ║
║                   📎 clipsync                            ║
║                                                           ║
║  Offline-first sync core for the web clipper             ║
║                                                           ║
╚═══════════════════════════════════════════════════════════╝
"#;

    println!("{}", banner);
    println!("  Version:     {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Bridge:      http://{}:{}",
        config.bridge_host, config.bridge_port
    );
    println!("  API:         {}", config.api_base_url);
    println!("  Timezone:    {}", config.user_timezone);
    println!("  Sync Every:  {}s", config.sync_interval);
    println!(
        "  Bridge Key:  {}",
        if config.bridge_api_key.is_some() {
            "required"
        } else {
            "none"
        }
    );
    println!("  Log Level:   {}", config.log_level);
    println!();
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
