use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use houkokusou::api::{self, AppState};
use houkokusou::config::AppConfig;
use houkokusou::llm::create_provider;
use houkokusou::store::{Database, Directory, LibSqlBackend, spawn_expiry_sweep};
use houkokusou::workflow::engine::INTERRUPTED_MESSAGE;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!("  export ANTHROPIC_API_KEY=sk-ant-...  (or OPENAI_API_KEY with HOUKOKUSOU_LLM_BACKEND=openai)");
            std::process::exit(1);
        }
    };

    let _log_guard = init_tracing(&config);

    eprintln!("📮 houkokusou v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Environment: {}", config.environment.as_str());
    eprintln!("   Model: {}", config.llm.model);
    eprintln!("   REST: http://{}/api/v1/chat", config.bind_addr);
    eprintln!("   WS: ws://{}/ws", config.bind_addr);

    let llm = create_provider(&config.llm).context("failed to create LLM provider")?;

    // ── Database ─────────────────────────────────────────────────────────
    let backend = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    let db: Arc<dyn Database> = backend.clone();
    let directory: Arc<dyn Directory> = backend;

    // Instances from a previous process cannot resume.
    let interrupted = db
        .fail_interrupted(INTERRUPTED_MESSAGE, chrono::Utc::now())
        .await
        .context("failed to close out interrupted workflows")?;
    if interrupted > 0 {
        tracing::warn!(conversations = interrupted, "Marked interrupted workflows as failed");
    }

    // ── Workflow + API ───────────────────────────────────────────────────
    let state = AppState::assemble(
        llm,
        db.clone(),
        directory,
        config.analysis.clone(),
        config.workflow.clone(),
    );
    let app = api::router(state, &config.allowed_origins);

    let sweep = spawn_expiry_sweep(db, config.sweep_interval);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("Listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    sweep.abort();
    tracing::info!("Shut down");
    Ok(())
}

/// Stderr always; a daily rolling file too when a log directory is set.
/// The returned guard must live until exit so buffered lines are flushed.
fn init_tracing(config: &AppConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "houkokusou.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    guard
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
