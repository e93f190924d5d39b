use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body as AxumBody;
use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::{Context, eyre};
use hyper::service::Service;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use keystone_gateway::adapters::http_handler;
use keystone_gateway::adapters::{HttpClientAdapter, HttpHandler};
use keystone_gateway::config::{GatewayConfigValidator, load_config};
use keystone_gateway::core::GatewayService;
use keystone_gateway::ports::http_client::HttpClient;
use keystone_gateway::utils::connection_tracker::ConnectionInfo;
use keystone_gateway::utils::{ConnectionTracker, GracefulShutdown};
use keystone_gateway::{metrics, tracing_setup};
use notify::{RecursiveMode, Watcher};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The currently running generation of per-tenant health-check tasks, so a
/// config reload can cancel and abort the previous generation before
/// spawning a fresh one rather than leaking an unreachable set of tasks each
/// time the config file changes (§4.9 reload).
struct HealthGeneration {
    cancel: CancellationToken,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Configuration file to use (YAML, JSON, or TOML, detected by extension)
    #[clap(short, long, default_value = "config.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Parse and validate a configuration file without starting the gateway
    Validate {
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let (command, config_path) = match args.command {
        Some(Commands::Validate { config }) => ("validate", config),
        Some(Commands::Serve { config }) => ("serve", config),
        None => ("serve", args.config),
    };

    if command == "validate" {
        return validate_config_command(&config_path).await;
    }

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(err) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(?err, "rustls CryptoProvider already installed; continuing");
    }

    tracing_setup::init_tracing().map_err(|err| eyre!("failed to initialize tracing: {err}"))?;
    metrics::init_metrics().map_err(|err| eyre!("failed to initialize metrics: {err}"))?;

    tracing::info!(config = %config_path, "loading initial configuration");
    let config = load_config(&config_path)
        .await
        .with_context(|| format!("failed to load configuration from {config_path}"))?;
    GatewayConfigValidator::validate(&config)
        .map_err(|err| eyre!("configuration is invalid: {err}"))?;

    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().context("failed to build HTTP client adapter")?);

    let listen_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid listen address '{}:{}'",
                config.server.host, config.server.port
            )
        })?;
    let shutdown_grace = Duration::from_secs(config.server.shutdown_grace_secs);

    let gateway = Arc::new(GatewayService::new(config, http_client.clone()).await);
    let connection_tracker = Arc::new(ConnectionTracker::new());
    let http_handler = Arc::new(HttpHandler::new(gateway.clone(), http_client.clone()));

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    {
        let signal_shutdown = graceful_shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = signal_shutdown.run_signal_handler().await {
                tracing::error!(%err, "signal handler error");
            }
        });
    }

    let health_cancel = CancellationToken::new();
    let health_handles = keystone_gateway::adapters::health_checker::spawn_all(
        gateway.clone(),
        http_client.clone(),
        health_cancel.clone(),
    );
    let health_generation = Arc::new(std::sync::Mutex::new(HealthGeneration {
        cancel: health_cancel.clone(),
        handles: health_handles,
    }));

    let watcher_task = spawn_config_watcher(
        config_path.clone(),
        gateway.clone(),
        http_client.clone(),
        health_generation.clone(),
    );

    tracing::info!(addr = %listen_addr, "keystone gateway listening");
    println!("keystone-gateway listening on {listen_addr}");

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    let shutdown_token = graceful_shutdown.shutdown_token();
    run_accept_loop(listener, http_handler, connection_tracker.clone(), shutdown_token).await;

    tracing::info!("shutdown signal received; draining connections");
    connection_tracker.signal_shutdown();
    if !connection_tracker.wait_for_drain(shutdown_grace).await {
        tracing::warn!("shutdown grace period elapsed with requests still in flight");
    }

    let current_generation = {
        let mut guard = health_generation.lock().unwrap();
        std::mem::replace(
            &mut *guard,
            HealthGeneration {
                cancel: CancellationToken::new(),
                handles: Vec::new(),
            },
        )
    };
    current_generation.cancel.cancel();
    for handle in current_generation.handles {
        handle.abort();
    }
    watcher_task.abort();

    tracing_setup::shutdown_tracing();
    Ok(())
}

/// Accepts connections until a shutdown signal fires, serving each one on
/// its own task via the auto h1/h2 builder so a connection's lifetime maps
/// 1:1 onto a [`ConnectionTracker`] entry (§1 ambient connection tracking).
async fn run_accept_loop(
    listener: TcpListener,
    http_handler: Arc<HttpHandler>,
    connection_tracker: Arc<ConnectionTracker>,
    mut shutdown_token: keystone_gateway::utils::graceful_shutdown::ShutdownToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(%err, "failed to accept connection");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let connection_info = connection_tracker.register_connection(remote_addr);
                let service = RequestService {
                    handler: http_handler.clone(),
                    connection_info: connection_info.clone(),
                };
                let connection_tracker = connection_tracker.clone();

                tokio::spawn(async move {
                    let builder = ConnectionBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection_with_upgrades(io, service).await {
                        tracing::debug!(%err, remote = %remote_addr, "connection closed with error");
                    }
                    connection_tracker.unregister_connection(connection_info.id);
                });
            }
            reason = shutdown_token.wait_for_shutdown() => {
                tracing::info!(?reason, "accept loop stopping");
                return;
            }
        }
    }
}

/// Per-connection [`hyper::service::Service`] wrapping [`HttpHandler`];
/// attaches the accepted connection's [`ConnectionInfo`] to every request so
/// the handler can track active-request counts without looking anything up
/// by address (§1 ambient connection tracking).
#[derive(Clone)]
struct RequestService {
    handler: Arc<HttpHandler>,
    connection_info: Arc<ConnectionInfo>,
}

impl Service<Request<hyper::body::Incoming>> for RequestService {
    type Response = Response<AxumBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<hyper::body::Incoming>) -> Self::Future {
        let handler = self.handler.clone();
        let connection_info = self.connection_info.clone();
        Box::pin(async move {
            let mut req = req.map(AxumBody::new);
            req.extensions_mut().insert(connection_info);
            match handler.handle_request(req).await {
                Ok(response) => Ok(response),
                Err(err) => {
                    tracing::error!(%err, "request handling error");
                    Ok(http_handler::error_response(&err))
                }
            }
        })
    }
}

/// Watches the configuration file's directory for changes and hot-reloads
/// the gateway when it changes, debounced to coalesce editor-generated
/// bursts of filesystem events (§4.9).
fn spawn_config_watcher(
    config_path: String,
    gateway: Arc<GatewayService>,
    http_client: Arc<dyn HttpClient>,
    health_generation: Arc<std::sync::Mutex<HealthGeneration>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (tx, mut rx) = mpsc::channel::<()>(8);
        let watch_target = Path::new(&config_path)
            .file_name()
            .unwrap_or_default()
            .to_os_string();

        let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    let matches = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().unwrap_or_default() == watch_target);
                    if matches {
                        let _ = tx.try_send(());
                    }
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(%err, "config file watch error"),
            }
        }) {
            Ok(w) => w,
            Err(err) => {
                tracing::warn!(%err, "failed to start config file watcher; hot reload disabled");
                return;
            }
        };

        let watch_dir = Path::new(&config_path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        if let Err(err) = watcher.watch(watch_dir, RecursiveMode::NonRecursive) {
            tracing::warn!(%err, dir = %watch_dir.display(), "failed to watch config directory; hot reload disabled");
            return;
        }

        let debounce = Duration::from_secs(2);
        let mut last_reload = tokio::time::Instant::now()
            .checked_sub(debounce)
            .unwrap_or_else(tokio::time::Instant::now);

        while rx.recv().await.is_some() {
            if last_reload.elapsed() < debounce {
                while rx.try_recv().is_ok() {}
                continue;
            }
            last_reload = tokio::time::Instant::now();
            while rx.try_recv().is_ok() {}

            tracing::info!(config = %config_path, "reloading configuration");
            match load_config(&config_path).await {
                Ok(new_config) => match GatewayConfigValidator::validate(&new_config) {
                    Ok(()) => {
                        gateway.reload(new_config).await;

                        let new_cancel = CancellationToken::new();
                        let new_handles = keystone_gateway::adapters::health_checker::spawn_all(
                            gateway.clone(),
                            http_client.clone(),
                            new_cancel.clone(),
                        );
                        let previous = {
                            let mut guard = health_generation.lock().unwrap();
                            std::mem::replace(
                                &mut *guard,
                                HealthGeneration {
                                    cancel: new_cancel,
                                    handles: new_handles,
                                },
                            )
                        };
                        previous.cancel.cancel();
                        for handle in previous.handles {
                            handle.abort();
                        }
                        tracing::info!("configuration reloaded");
                    }
                    Err(err) => {
                        tracing::error!(%err, "reloaded configuration failed validation; keeping previous configuration");
                    }
                },
                Err(err) => {
                    tracing::error!(%err, "failed to reload configuration; keeping previous configuration");
                }
            }
        }
    })
}

async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("error: configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("configuration parsing: OK");
            config
        }
        Err(err) => {
            eprintln!("configuration parsing failed:\n  {err}");
            std::process::exit(1);
        }
    };

    match GatewayConfigValidator::validate(&config) {
        Ok(()) => {
            println!("configuration validation: OK");
            println!();
            println!("summary:");
            println!("  listen address: {}:{}", config.server.host, config.server.port);
            println!("  admin base path: {}", config.admin_base_path);
            println!("  tenants: {}", config.tenants.len());
            for tenant in &config.tenants {
                println!(
                    "    - {} ({} backend(s), scripts: {})",
                    tenant.name,
                    tenant.backends.len(),
                    tenant.script_dir.as_deref().unwrap_or("none")
                );
            }
            Ok(())
        }
        Err(err) => {
            eprintln!("configuration validation failed:\n{err}");
            std::process::exit(1);
        }
    }
}
