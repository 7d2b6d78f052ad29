use std::{io::Write, process, sync::Arc};

use subrelay::{
    application::{
        error::AppError,
        refresh::ProviderRefresher,
        repos::{ConfigsRepo, SubscriptionsRepo},
    },
    cache::{ProviderCache, ProviderService, Scheduler, SchedulerConfig},
    config,
    domain::entities::ConfigId,
    infra::{
        catalog::TomlCatalog,
        error::InfraError,
        http::{self, HttpState},
        telemetry,
        upstream::HttpRefresher,
    },
};
use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Refresh(args) => run_refresh(settings, args).await,
    }
}

struct Components {
    catalog: Arc<TomlCatalog>,
    refresher: Arc<dyn ProviderRefresher>,
    cache: Arc<ProviderCache>,
    providers: Arc<ProviderService>,
}

fn build_components(settings: &config::Settings) -> Result<Components, AppError> {
    let catalog = Arc::new(TomlCatalog::new(settings.catalog.path.clone()));
    let refresher: Arc<dyn ProviderRefresher> =
        Arc::new(HttpRefresher::new(&settings.upstream).map_err(AppError::from)?);
    let cache = Arc::new(ProviderCache::new(settings.scheduler.default_interval));
    let providers = Arc::new(ProviderService::new(
        cache.clone(),
        refresher.clone(),
        settings.scheduler.refresh_timeout,
    ));

    Ok(Components {
        catalog,
        refresher,
        cache,
        providers,
    })
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let components = build_components(&settings)?;
    let configs: Arc<dyn ConfigsRepo> = components.catalog.clone();
    let subscriptions: Arc<dyn SubscriptionsRepo> = components.catalog.clone();

    let scheduler = Arc::new(Scheduler::new(
        SchedulerConfig::from(&settings.scheduler),
        configs.clone(),
        subscriptions.clone(),
        components.refresher.clone(),
        components.cache.clone(),
    )?);

    info!(
        target: "subrelay::serve",
        catalog = %components.catalog.path().display(),
        addr = %settings.server.addr,
        "Starting subrelay"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

    let state = HttpState {
        configs,
        subscriptions,
        providers: components.providers,
    };
    let result = serve_http(&settings, state).await;

    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(settings.server.graceful_shutdown, scheduler_handle).await {
        Ok(Ok(())) => info!(target: "subrelay::serve", "Scheduler drained"),
        Ok(Err(err)) => warn!(target: "subrelay::serve", error = %err, "Scheduler task failed"),
        Err(_) => warn!(
            target: "subrelay::serve",
            grace_secs = settings.server.graceful_shutdown.as_secs(),
            "Scheduler did not drain before the grace period elapsed"
        ),
    }

    result
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(target: "subrelay::serve", error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!(target: "subrelay::serve", "Shutdown signal received");
}

async fn run_refresh(settings: config::Settings, args: config::RefreshArgs) -> Result<(), AppError> {
    let components = build_components(&settings)?;
    let id = ConfigId(args.config_id);

    let configuration = components
        .catalog
        .find_config(id)
        .await
        .map_err(|err| AppError::unexpected(format!("catalog lookup failed: {err}")))?
        .ok_or_else(|| AppError::not_found(format!("configuration {id}")))?;

    let subscription = components
        .catalog
        .get_subscription(configuration.subscription_id, &configuration.owner)
        .await
        .map_err(|err| {
            AppError::not_found(format!(
                "subscription {} for configuration {id}: {err}",
                configuration.subscription_id
            ))
        })?;

    let entry = components
        .providers
        .refresh(&configuration, &subscription)
        .await?;

    info!(
        target: "subrelay::refresh",
        config_id = %id,
        node_count = entry.node_count,
        "Provider materialized"
    );

    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(&entry.document)
        .and_then(|()| stdout.flush())
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    Ok(())
}
