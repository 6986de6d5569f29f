use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request},
    middleware,
    response::Response,
    routing::any,
};
use clap::{Parser, Subcommand};
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use portico::{
    adapters::{EtcdRegistry, HttpClientAdapter, ProxyHandler, middleware::access_log_middleware},
    config,
    core::{Exchange, LivenessPublisher, Mux},
    ports::{http_client::HttpClient, registry::Registry},
    tracing_setup,
    utils::GracefulShutdown,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Log in human-readable form instead of JSON
    #[clap(long)]
    pretty_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the environment configuration and exit
    Check,
    /// Start the gateway (default)
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    if args.pretty_logs {
        tracing_setup::init_console_tracing()?;
    } else {
        tracing_setup::init_tracing()?;
    }

    match args.command {
        Some(Commands::Check) => check_config_command(),
        Some(Commands::Serve) | None => serve().await,
    }
}

/// Validate configuration and exit; nonzero on failure.
fn check_config_command() -> Result<()> {
    match config::load_from_env() {
        Ok(config) => {
            println!("Configuration OK");
            println!("  namespace:    {}", config.namespace);
            println!("  environment:  {}", config.environment);
            println!("  port:         {}", config.port);
            println!("  registry:     {}", config.etcd_client_peers.join(", "));
            Ok(())
        }
        Err(error) => {
            eprintln!("Configuration invalid: {error}");
            std::process::exit(1);
        }
    }
}

async fn serve() -> Result<()> {
    let config = config::load_from_env().context("gateway configuration is incomplete")?;

    let registry: Arc<dyn Registry> = Arc::new(
        EtcdRegistry::from_config(&config).context("failed to build registry client")?,
    );
    let mux = Arc::new(Mux::new());

    let publisher = Arc::new(LivenessPublisher::with_timing(
        Arc::clone(&registry),
        &config.environment,
        config.port,
        config.publish_interval(),
        config.publish_ttl(),
    ));

    let mut exchange = Exchange::new(
        config.namespace.clone(),
        config.environment.clone(),
        Arc::clone(&registry),
        Arc::clone(&mux),
    )
    .with_publisher(Arc::clone(&publisher));

    exchange
        .init()
        .await
        .context("initial registry sync failed")?;

    // Watch for service changes in the registry. The exchange updates the
    // routing table as services come and go.
    tokio::spawn(async move {
        tracing::info!("watching for service configuration changes in the registry");
        exchange.watch().await;
    });

    tokio::spawn(Arc::clone(&publisher).run());

    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().context("failed to create backend HTTP client")?);
    let proxy = Arc::new(ProxyHandler::new(
        Arc::clone(&mux),
        http_client,
        config.trust_forward_header,
    ));

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    let signal_handler_shutdown = Arc::clone(&graceful_shutdown);
    tokio::spawn(async move {
        if let Err(error) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!(%error, "signal handler error");
        }
    });

    let make_proxy_route = |proxy: Arc<ProxyHandler>| {
        any(
            move |ConnectInfo(client_addr): ConnectInfo<SocketAddr>, req: Request| {
                let proxy = Arc::clone(&proxy);
                async move {
                    let response: Response<Body> =
                        proxy.handle(req, Some(client_addr), false).await;
                    response
                }
            },
        )
    };

    let app = Router::new()
        .route("/{*path}", make_proxy_route(Arc::clone(&proxy)))
        .route("/", make_proxy_route(proxy))
        .layer(middleware::from_fn(access_log_middleware));

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;

    tracing::info!(port = config.port, "listening for HTTP requests");

    tokio::select! {
        result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        ) => {
            result.map_err(|error| eyre!("server error: {error}"))
        }
        reason = graceful_shutdown.wait_for_shutdown_signal() => {
            tracing::info!("shutdown signal received: {:?}", reason);
            Ok(())
        }
    }
}
