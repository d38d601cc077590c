use std::sync::Arc;
use std::time::Duration;

use llm_proxy::config::ProxyConfig;
use llm_proxy::cost::{CostTracker, FileTransport, PricingTable, Transport, create_transport};
use llm_proxy::keys::ConfigKeyStore;
use llm_proxy::providers::ProviderRegistry;
use llm_proxy::ratelimit::MemoryRateLimiter;
use llm_proxy::{DEFAULT_PORT, ProxyState, VERSION, build_router};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config_paths: Vec<String> = Vec::new();
    let mut validate_paths: Option<String> = None;
    let mut show_version = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let value = args.next().ok_or("missing value for --config")?;
                config_paths.extend(split_paths(&value));
            }
            "--validate-config" => {
                validate_paths = Some(args.next().ok_or("missing value for --validate-config")?);
            }
            "--version" => show_version = true,
            other => return Err(format!("unknown arg: {other}").into()),
        }
    }

    if let Some(paths) = validate_paths {
        return validate_config(&split_paths(&paths));
    }

    init_tracing();

    let config = match ProxyConfig::load_files(&config_paths) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(error = %err, "failed to load config, using defaults");
            ProxyConfig::default()
        }
    };

    if show_version {
        println!("llm-proxy {VERSION}");
        println!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    run_server(config).await
}

fn split_paths(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .map(str::to_string)
        .collect()
}

fn validate_config(paths: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    println!("validating configuration files: {}", paths.join(", "));
    match ProxyConfig::load_files(paths) {
        Ok(config) => {
            println!("configuration ok: {}", config.summary());
            Ok(())
        }
        Err(err) => {
            eprintln!("configuration validation failed: {err}");
            std::process::exit(1);
        }
    }
}

/// `LOG_LEVEL` selects the filter, `LOG_FORMAT=json` switches to JSON lines
/// for machine parsing; anything else stays human-readable.
fn init_tracing() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_new(&level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn initialize_cost_tracker(config: &ProxyConfig) -> Option<CostTracker> {
    let tracking = &config.features.cost_tracking;
    if !tracking.enabled {
        tracing::info!("cost tracking is disabled in config");
        return None;
    }

    let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
    let mut failed: Vec<String> = Vec::new();
    for transport_config in &tracking.transports {
        match create_transport(transport_config) {
            Ok(transport) => {
                tracing::info!(transport = transport.name(), "cost transport created");
                transports.push(transport);
            }
            Err(err) => {
                tracing::error!(
                    transport = %transport_config.kind,
                    error = %err,
                    "failed to create cost transport"
                );
                failed.push(transport_config.kind.clone());
            }
        }
    }

    if transports.is_empty() {
        let path = std::env::var("COST_TRACKING_FILE")
            .unwrap_or_else(|_| "logs/cost-tracking.jsonl".to_string());
        tracing::warn!(path = %path, "no cost transports available, falling back to file transport");
        transports.push(Arc::new(FileTransport::new(path)));
    }
    if !failed.is_empty() {
        tracing::warn!(failed = ?failed, "some cost transports could not be created");
    }

    let pricing = PricingTable::from_config(&config.providers);
    tracing::info!(priced_models = pricing.len(), "configured pricing");

    let mut tracker = CostTracker::new(transports, pricing);
    if tracking.async_mode {
        tracker.start_async_workers(
            tracking.workers,
            tracking.queue_size,
            Duration::from_secs(tracking.flush_interval.max(1)),
        );
        tracing::info!(
            workers = tracking.workers,
            queue_size = tracking.queue_size,
            flush_interval = tracking.flush_interval,
            "cost tracking: async mode enabled"
        );
    } else {
        tracing::info!("cost tracking: synchronous mode enabled");
    }
    Some(tracker)
}

async fn run_server(config: ProxyConfig) -> Result<(), Box<dyn std::error::Error>> {
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let registry = ProviderRegistry::with_default_providers();
    for provider in registry.iter() {
        tracing::info!(provider = provider.name(), "registered provider");
    }

    let mut state = ProxyState::new(registry)?
        .with_estimation(config.features.rate_limiting.estimation.clone());

    let rate_limiting = &config.features.rate_limiting;
    if rate_limiting.enabled {
        match rate_limiting.backend.as_str() {
            "memory" => {
                state = state.with_limiter(Arc::new(MemoryRateLimiter::from_config(rate_limiting)));
                tracing::info!(
                    backend = %rate_limiting.backend,
                    rpm = ?rate_limiting.limits.requests_per_minute,
                    tpm = ?rate_limiting.limits.tokens_per_minute,
                    rpd = ?rate_limiting.limits.requests_per_day,
                    tpd = ?rate_limiting.limits.tokens_per_day,
                    "rate limiting enabled"
                );
            }
            other => {
                // Fail open: an unavailable limiter backend must not take
                // the proxy down with it.
                tracing::error!(backend = %other, "unknown rate-limit backend, rate limiting disabled");
            }
        }
    }

    let cost_tracker = initialize_cost_tracker(&config).map(Arc::new);
    if let Some(tracker) = cost_tracker.clone() {
        state = state.with_cost_tracker(tracker);
    }

    if config.features.api_keys.enabled {
        let store = ConfigKeyStore::from_config(&config.features.api_keys);
        tracing::info!(keys = store.len(), "api key store enabled");
        state = state.with_key_store(Arc::new(store));
    }

    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "starting llm-proxy server");
    tracing::info!(url = %format!("http://0.0.0.0:{port}/health"), "health check available");
    tracing::info!(pattern = %format!("http://0.0.0.0:{port}/meta/{{user_id}}/{{provider}}/"), "meta routes available");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Some(tracker) = cost_tracker {
        tracing::info!("draining usage record queue");
        tracker.shutdown(Duration::from_secs(30)).await;
    }
    tracing::info!("server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("received shutdown signal");
}
