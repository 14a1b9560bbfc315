use parley::constants::STORE_COMMAND_CAPACITY;
use parley::db::{init_db, SqliteHistory};
use parley::kernel::StoreKernel;
use parley::main_helper::Secrets;
use parley::realtime::BroadcastRealtime;
use parley::recovery::HttpCredentialSource;
use parley::redaction_layer::RedactingWriter;
use parley::streaming::StreamHandler;
use parley::transport::HttpTransport;
use parley::*;

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Arc::new(Args::parse());

    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "parley=debug".into(),
    };

    let _ = std::fs::create_dir_all(&args.log_dir);
    let file_appender = tracing_appender::rolling::daily(&args.log_dir, "parley.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(move || RedactingWriter::new(non_blocking.clone()))
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    parley::logging::setup_panic_hook();

    let secrets = match Secrets::from_env() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e.inner);
            eprintln!("Please set it in your .env file or environment.");
            std::process::exit(1);
        }
    };

    let db = match init_db(&args.database, args.retention_days).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e.inner);
            std::process::exit(1);
        }
    };

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(args.request_timeout_secs))
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let cipher = Arc::new(secrets.cipher);
    let store = StoreKernel::spawn(cipher.clone(), args.realtime_capacity, STORE_COMMAND_CAPACITY);
    let realtime = BroadcastRealtime::new(args.realtime_capacity);
    let history = Arc::new(SqliteHistory::new(db.clone(), cipher));

    let transport = Arc::new(HttpTransport::new(client.clone(), args.upstream_url.clone()));
    let credentials = Arc::new(HttpCredentialSource::new(
        client,
        args.refresh_url.clone(),
        secrets.api_token,
        secrets.refresh_token,
    ));
    let handler = StreamHandler::new(
        transport,
        credentials,
        Arc::new(realtime.clone()),
        store.clone(),
        args.decoder_config(),
    )
    .with_archive(history.clone());

    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState {
        args: args.clone(),
        db,
        store,
        realtime,
        history,
        handler: Arc::new(handler),
        shutdown: shutdown.clone(),
    });

    let app = parley::server::router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Parley listening on {}", addr);
    let signal = shutdown.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown requested, cancelling running turns");
            signal.cancel();
        })
        .await;

    if let Err(e) = result {
        tracing::error!("Server error: {}", e);
    }
}
