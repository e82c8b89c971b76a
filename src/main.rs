use std::sync::Arc;
use std::time::Duration;

use axum::{response::Json, Extension, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use screencast_pipeline::config::{CheckpointBackend, Settings};
use screencast_pipeline::handlers;
use screencast_pipeline::ledger::StageLedger;
use screencast_pipeline::middleware;
use screencast_pipeline::projects::{ProjectManager, ProjectStatus, ProjectStore};
use screencast_pipeline::storage::{MemoryStore, PgStore};
use screencast_pipeline::workflow::checkpoint::{
    CheckpointStore, FileCheckpointStore, PgCheckpointStore,
};
use screencast_pipeline::{db, AppState};

#[tokio::main]
async fn main() {
    init_logging().expect("Failed to initialize logging");

    let settings = Settings::from_env().expect("Invalid configuration");
    for issue in settings.pipeline.validate() {
        tracing::warn!("⚠️ Pipeline config: {}", issue);
    }

    if let Err(e) = std::fs::create_dir_all(&settings.projects_dir) {
        tracing::warn!("Failed to create projects directory: {}", e);
    } else {
        tracing::info!("Projects directory ready: {}", settings.projects_dir.display());
    }

    let manager = build_project_manager(&settings).await;
    let shared_state = Arc::new(AppState {
        projects: manager,
        retention_days: settings.project_retention_days,
    });

    spawn_cleanup_loop(
        shared_state.clone(),
        Duration::from_secs(settings.cleanup_interval_secs),
    );

    let app = Router::new()
        .merge(handlers::projects::project_routes())
        .route("/api/status", axum::routing::get(api_status))
        .layer(axum::middleware::from_fn(
            middleware::logging::request_logging_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(Extension(shared_state));

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .expect("Failed to bind listener");
    tracing::info!("listening on {}", settings.bind_addr);
    axum::serve(listener, app)
        .await
        .expect("Server error");
}

/// Postgres backs the ledger and projects when DATABASE_URL is set; otherwise in-memory
async fn build_project_manager(settings: &Settings) -> ProjectManager {
    let Some(database_url) = settings.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set. Stage ledger and projects are kept in memory.");
        let store = Arc::new(MemoryStore::new());
        let checkpoints: Arc<dyn CheckpointStore> = match settings.checkpoint_backend {
            CheckpointBackend::File => {
                Arc::new(FileCheckpointStore::new(&settings.projects_dir))
            }
            CheckpointBackend::Postgres => {
                tracing::warn!("Postgres checkpoints need DATABASE_URL, keeping them in memory");
                store.clone()
            }
        };
        return ProjectManager::new(store.clone(), store, checkpoints);
    };

    let pool = db::create_pool(database_url, settings.database_max_connections)
        .await
        .expect("Failed to create database pool.");
    tracing::info!("🗄️ Connected to Postgres");

    let store = Arc::new(PgStore::new(pool.clone()));
    let checkpoints: Arc<dyn CheckpointStore> = match settings.checkpoint_backend {
        CheckpointBackend::File => Arc::new(FileCheckpointStore::new(&settings.projects_dir)),
        CheckpointBackend::Postgres => Arc::new(PgCheckpointStore::new(pool)),
    };
    let projects: Arc<dyn ProjectStore> = store.clone();
    let ledger: Arc<dyn StageLedger> = store;
    ProjectManager::new(projects, ledger, checkpoints)
}

fn spawn_cleanup_loop(state: Arc<AppState>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match state.projects.cleanup_old_projects(state.retention_days).await {
                Ok(deleted) if deleted > 0 => {
                    tracing::info!("🧹 Retention cleanup removed {} projects", deleted)
                }
                Ok(_) => tracing::debug!("Retention cleanup found nothing to remove"),
                Err(e) => tracing::error!("Retention cleanup failed: {}", e),
            }
        }
    });
}

async fn api_status(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    let (storage, processing) = match state
        .projects
        .list_projects(None, Some(ProjectStatus::Processing))
        .await
    {
        Ok(projects) => ("healthy", projects.len()),
        Err(e) => {
            tracing::error!("Storage health check failed: {}", e);
            ("unhealthy", 0)
        }
    };

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "storage": storage,
        "processing_projects": processing,
        "retention_days": state.retention_days,
    }))
}

// Production-grade logging configuration
fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug,screencast_pipeline=trace,sqlx=info,hyper=info,tower=info".to_string()
        } else {
            "info,screencast_pipeline=info,sqlx=warn,hyper=warn,tower=warn".to_string()
        }
    });

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?;

    let fmt_layer = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("🎬 Screencast pipeline starting up...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
