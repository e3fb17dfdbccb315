mod config;

use anyhow::Context as _;
use clap::Parser as _;
use config::Config;
use std::sync::Arc;
use switchyard::auth::EnvSecrets;
use switchyard::client::create_hyper_client;
use switchyard::compute::{ComputeManager, ContainerControl, DockerControl};
use switchyard::registry::Registry;
use switchyard::{AppState, build_metrics_layer_and_handle, build_metrics_router, build_router};
use tokio::net::TcpListener;
use tracing::{info, instrument, warn};

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
    }
}

#[tokio::main]
#[instrument]
pub async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse().validate()?;
    info!("Starting Switchyard with config: {:?}", config);

    let registry = Arc::new(
        Registry::from_config_file(&config.providers)
            .await
            .context("Failed to load providers")?,
    );
    for provider_id in registry.providers_without_models() {
        warn!(provider = %provider_id, "Provider serves no models");
    }

    let http_client = create_hyper_client();

    let has_managed = registry.list_providers().iter().any(|p| p.is_managed());
    let compute = has_managed.then(|| {
        let control: Arc<dyn ContainerControl> = Arc::new(DockerControl::with_client(
            config.container_cli.clone(),
            http_client.clone(),
        ));
        Arc::new(ComputeManager::new(Arc::clone(&registry), control))
    });

    let app_state = AppState::with_options(
        Arc::clone(&registry),
        http_client,
        Arc::new(EnvSecrets),
        config.router(),
        config.health_check(),
        compute.clone(),
    );

    let health_task = app_state.health.spawn();
    let reaper_task = compute
        .as_ref()
        .map(|compute| compute.spawn_reaper(config.reaper_interval()));

    let mut router = build_router(app_state);

    if config.metrics {
        let (prometheus_layer, handle) = build_metrics_layer_and_handle(config.metrics_prefix.clone());
        router = router.layer(prometheus_layer);

        let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr)
            .await
            .with_context(|| format!("Failed to bind metrics listener on {metrics_addr}"))?;
        info!("Metrics endpoint listening on {}", metrics_addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, build_metrics_router(handle)).await {
                warn!(error = %e, "Metrics server stopped");
            }
        });
    }

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    info!("Switchyard listening on {}", bind_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    health_task.stop().await;
    if let Some(reaper) = reaper_task {
        reaper.stop().await;
    }
    info!("Switchyard stopped");

    Ok(())
}
