// define modules in crate
mod auth;
mod config;
mod cqrs;
mod domain;
mod dtos;
mod error;
mod events;
mod indexes;
mod metrics;
mod repositories;
mod routes;
mod state;
mod uow;

use std::sync::Arc;

use axum::routing::get;
use axum_prometheus::PrometheusMetricLayer;
use config::Config;
use dotenv::dotenv;
use events::{InMemoryMessageBroker, MessageBroker, RabbitMqMessageBroker};
use repositories::{
    MongoDbInitializationInfo, MongoDbLoginAttemptRepository, MongoDbTokenBlacklistRepository, MongoDbUserRepository,
};
use state::AppState;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{event, Level};

use crate::{auth::JwtService, metrics::PrometheusMetricsService, uow::RepositoryContext};

#[tokio::main]
async fn main() {
    dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            // No log file is known yet, so report on stdout.
            let _ = init_tracing(None);
            event!(Level::ERROR, "Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_tracing(config.log_path.as_deref()) {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(config).await {
        event!(Level::ERROR, "Service stopped: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(log_path: Option<&str>) -> Result<(), String> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_target(false)
        .with_ansi(false)
        .json()
        .with_file(true)
        .with_line_number(true)
        .with_current_span(true);

    match log_path {
        Some(path) => {
            let file = std::fs::File::create(path).map_err(|e| format!("Could not create log file {}: {}", path, e))?;
            subscriber.with_writer(file).init();
        }
        None => subscriber.with_writer(std::io::stdout).init(),
    }
    Ok(())
}

async fn run(config: Config) -> Result<(), String> {
    let info = MongoDbInitializationInfo {
        uri: config.mongo.connection_uri(),
        database: config.mongo.database.clone(),
    };
    let (_client, database) = repositories::connect(&info)
        .await
        .map_err(|e| format!("Could not connect to MongoDB: {}", e))?;

    indexes::ensure_indexes(&database)
        .await
        .map_err(|e| format!("Could not create indexes: {}", e))?;

    let message_broker: Arc<dyn MessageBroker> = match &config.rabbitmq {
        Some(rabbitmq) => Arc::new(RabbitMqMessageBroker::new(rabbitmq).await?),
        None => {
            event!(Level::WARN, "RABBITMQ_URI not set, domain events will only be logged");
            Arc::new(InMemoryMessageBroker::new())
        }
    };

    let uow = Arc::new(RepositoryContext::new(
        Arc::new(MongoDbUserRepository::new(&database)),
        Arc::new(MongoDbLoginAttemptRepository::new(&database)),
        Arc::new(MongoDbTokenBlacklistRepository::new(&database)),
        message_broker,
    ));
    let jwt_service = Arc::new(JwtService::new(&config.jwt));
    let auth_metrics = Arc::new(
        PrometheusMetricsService::new().map_err(|e| format!("Could not register auth metrics: {}", e))?,
    );
    let state = Arc::new(AppState::new(uow, jwt_service, auth_metrics, Some(database)));

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();

    let app = routes::router(state, routes::cors_layer(&config.cors_allowed_origins))
        .route("/metrics", get(|| async move { metrics_handle.render() }))
        .layer(prometheus_layer)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let address = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|e| format!("Could not bind {}: {}", address, e))?;
    event!(Level::INFO, "Listening on {}", address);

    axum::serve(listener, app).await.map_err(|e| format!("Server error: {}", e))
}
