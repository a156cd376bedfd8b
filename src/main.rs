use airwave_monitor::api::{self, AppState};
use airwave_monitor::config::Config;
use airwave_monitor::services::{
    EventBus, LocalMatcher, PipelineContext, Recognizer, Scheduler, StationSupervisor,
    StatsRecorder, TrackRegistry,
};
use axum::http::{header, Method};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,airwave_monitor=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await?;
    tracing::info!("Connected to database");

    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("Database migrations completed");

    // Recognition stack: local index warmed from the store, external tiers
    // behind shared rate limits.
    let matcher = Arc::new(LocalMatcher::new(config.recognition.local_min_confidence));
    let warmed = matcher.warm(&pool).await?;
    tracing::info!("Fingerprint index warmed with {warmed} entries");

    let registry = Arc::new(TrackRegistry::new(pool.clone(), matcher.clone()));
    let recognizer = Recognizer::new(&config.recognition, matcher.clone(), registry.clone());
    let recorder = StatsRecorder::new(pool.clone(), config.tracker.clone());
    let bus = Arc::new(EventBus::new());

    let ctx = Arc::new(PipelineContext::new(
        pool.clone(),
        config.clone(),
        recognizer,
        registry,
        recorder,
        bus.clone(),
    ));
    let supervisor = Arc::new(StationSupervisor::new(ctx.clone()));
    let scheduler = Arc::new(Scheduler::new(ctx, supervisor.clone()));

    let started = supervisor.load_active_stations().await?;
    tracing::info!("Monitoring {started} stations");

    let status_task = scheduler.spawn_status_task();

    let app_state = Arc::new(AppState {
        pool,
        scheduler: scheduler.clone(),
        bus,
    });

    let app = Router::new()
        .nest(
            "/api/v1",
            Router::new()
                .merge(api::station_routes())
                .merge(api::event_routes())
                .with_state(app_state),
        )
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::CONTENT_TYPE]),
        );

    let addr = format!("{}:{}", config.server_host, config.server_port);
    tracing::info!("Starting server on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    // Stations drain their current plays before the process exits.
    scheduler.shutdown().await;
    status_task.abort();

    Ok(())
}
