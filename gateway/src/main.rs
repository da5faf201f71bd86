use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    error_handling::HandleErrorLayer,
    http::StatusCode,
    routing::{get, post},
    BoxError, Router,
};
use clap::Parser;
use enrich_core::assembler::{ActivityLog, Assembler};
use enrich_core::cache::EmbeddingCache;
use enrich_core::chunk::Source;
use enrich_core::corpus::{CorpusReader, InMemoryCorpusReader, SqliteCorpusReader};
use enrich_core::router::Router as EnrichRouter;
use enrich_core::runtime_client::{build_runtime_client, RuntimeClient};
use enrich_core::session::SessionStore;
use enrich_core::vector_index::VectorIndex;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};
use tracing_unwrap::ResultExt;

use crate::settings::{read_settings_file, InternalSettings};

mod routes;
mod settings;

pub struct ServerState {
    assembler: Assembler,
}

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Overrides the bind address read from Settings.toml.
    #[arg(long)]
    address: Option<String>,
}

/// One corpus reader per `Source`, each backed by a SQLite database named by an environment
/// variable, or an empty in-memory reader when unset so the gateway runs out of the box with no
/// corpora configured (§6, "Corpus sources" is out-of-band from the closed settings-file key set).
fn build_corpus_readers() -> anyhow::Result<Vec<Arc<dyn CorpusReader>>> {
    const TABLE: &str = "chunks";
    let sources = [
        (Source::Memory, "ENRICH_MEMORY_DB"),
        (Source::Chat, "ENRICH_CHAT_DB"),
        (Source::Telegram, "ENRICH_TELEGRAM_DB"),
    ];

    let mut readers: Vec<Arc<dyn CorpusReader>> = Vec::with_capacity(sources.len());
    for (source, env_var) in sources {
        match std::env::var(env_var) {
            Ok(path) => {
                readers.push(Arc::new(SqliteCorpusReader::open(source, &path, TABLE)?));
            }
            Err(_) => {
                tracing::info!(%source, "no corpus database configured, using empty in-memory reader");
                readers.push(Arc::new(InMemoryCorpusReader::new(source, Vec::new())));
            }
        }
    }
    Ok(readers)
}

fn build_assembler(settings: &InternalSettings) -> Assembler {
    let config = settings.other.clone();

    let runtime_client = build_runtime_client(Duration::from_secs(10), 2);
    let runtime = RuntimeClient::new(runtime_client, config.runtime_base_url.clone());

    let cache = EmbeddingCache::new(200, Duration::from_secs(5 * 60));
    let readers = build_corpus_readers().expect_or_log("Can't open corpus databases");
    let vector_index = VectorIndex::new(
        readers,
        Duration::from_millis(config.vector_index.stale_after_ms),
    );
    let session_store = SessionStore::new(config.features.history_compression);
    let router = EnrichRouter::new(
        runtime.clone(),
        config.routing.model.clone(),
        config.routing.fallback,
    );

    let activity_log = std::env::var("ENRICH_ACTIVITY_LOG")
        .ok()
        .map(ActivityLog::new);

    Assembler::new(
        cache,
        vector_index,
        session_store,
        router,
        runtime,
        config,
        activity_log,
    )
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let mut settings = read_settings_file().await;
    if let Some(address) = args.address {
        settings.address = address;
    }

    let address: SocketAddr = settings.address.parse().expect_or_log("Can't parse address");

    let server_state = Arc::new(ServerState {
        assembler: build_assembler(&settings),
    });

    let app = Router::new()
        .route("/assemble", post(routes::assemble))
        .route("/stats", get(routes::stats))
        .route(
            "/settings",
            get(settings::get_settings).put(settings::put_settings),
        )
        .with_state(server_state)
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(|error: BoxError| async move {
                    if error.is::<tower::timeout::error::Elapsed>() {
                        Ok(StatusCode::REQUEST_TIMEOUT)
                    } else {
                        Err((
                            StatusCode::INTERNAL_SERVER_ERROR,
                            format!("Unhandled internal error: {error}"),
                        ))
                    }
                }))
                .timeout(Duration::from_secs(30))
                .layer(TraceLayer::new_for_http()),
        );

    let url = format!("http://{address}");
    tracing::info!("Listening on {}", url);

    axum::Server::bind(&address)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap_or_log();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect_or_log("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect_or_log("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Signal received, starting graceful shutdown");
}
