//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, num::NonZeroU32, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "subrelay";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3400;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_CATALOG_PATH: &str = "catalog.toml";
const DEFAULT_WORKER_CAPACITY: u64 = 4;
const DEFAULT_SCAN_PERIOD_SECS: u64 = 15;
const DEFAULT_RELOAD_PERIOD_SECS: u64 = 300;
const DEFAULT_RETRY_BASE_SECS: u64 = 30;
const DEFAULT_RETRY_CAP_SECS: u64 = 600;
const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 60;
const DEFAULT_RELOAD_TIMEOUT_SECS: u64 = 30;
const DEFAULT_INTERVAL_SECS: u64 = 3600;
pub(crate) const DEFAULT_USER_AGENT: &str = "clash.meta";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 45;

/// Command-line arguments for the subrelay binary.
#[derive(Debug, Parser)]
#[command(
    name = "subrelay",
    version,
    about = "Proxy subscription relay with cached provider documents"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "SUBRELAY_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP service and the background refresh scheduler.
    Serve(Box<ServeArgs>),
    /// Materialize one configuration and print the provider document.
    Refresh(RefreshArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct RefreshArgs {
    #[command(flatten)]
    pub catalog: CatalogOverride,

    /// Identifier of the configuration to refresh.
    #[arg(value_name = "CONFIG_ID")]
    pub config_id: i64,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CatalogOverride {
    /// Override the catalog file path.
    #[arg(long = "catalog-path", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub catalog_path: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub catalog: CatalogOverride,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the number of concurrent refresh workers.
    #[arg(long = "scheduler-worker-capacity", value_name = "COUNT")]
    pub scheduler_worker_capacity: Option<u64>,

    /// Override the due-configuration scan period.
    #[arg(long = "scheduler-scan-period-seconds", value_name = "SECONDS")]
    pub scheduler_scan_period_seconds: Option<u64>,

    /// Override the configuration reload period.
    #[arg(long = "scheduler-reload-period-seconds", value_name = "SECONDS")]
    pub scheduler_reload_period_seconds: Option<u64>,

    /// Override the refresh timeout.
    #[arg(long = "scheduler-refresh-timeout-seconds", value_name = "SECONDS")]
    pub scheduler_refresh_timeout_seconds: Option<u64>,

    /// Override the default upstream user agent.
    #[arg(long = "upstream-user-agent", value_name = "UA")]
    pub upstream_user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub catalog: CatalogSettings,
    pub scheduler: SchedulerSettings,
    pub upstream: UpstreamSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CatalogSettings {
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub worker_capacity: NonZeroU32,
    pub scan_period: Duration,
    pub reload_period: Duration,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub refresh_timeout: Duration,
    pub reload_timeout: Duration,
    pub default_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub user_agent: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("SUBRELAY").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Refresh(args)) => raw.apply_catalog_override(&args.catalog),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    catalog: RawCatalogSettings,
    scheduler: RawSchedulerSettings,
    upstream: RawUpstreamSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(capacity) = overrides.scheduler_worker_capacity {
            self.scheduler.worker_capacity = Some(capacity);
        }
        if let Some(seconds) = overrides.scheduler_scan_period_seconds {
            self.scheduler.scan_period_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.scheduler_reload_period_seconds {
            self.scheduler.reload_period_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.scheduler_refresh_timeout_seconds {
            self.scheduler.refresh_timeout_seconds = Some(seconds);
        }
        if let Some(user_agent) = overrides.upstream_user_agent.as_ref() {
            self.upstream.user_agent = Some(user_agent.clone());
        }

        self.apply_catalog_override(&overrides.catalog);
    }

    fn apply_catalog_override(&mut self, overrides: &CatalogOverride) {
        if let Some(path) = overrides.catalog_path.as_ref() {
            self.catalog.path = Some(path.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            catalog,
            scheduler,
            upstream,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            catalog: build_catalog_settings(catalog)?,
            scheduler: build_scheduler_settings(scheduler)?,
            upstream: build_upstream_settings(upstream)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_shutdown = positive_secs(
        server.graceful_shutdown_seconds,
        DEFAULT_GRACEFUL_SHUTDOWN_SECS,
        "server.graceful_shutdown_seconds",
    )?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_catalog_settings(catalog: RawCatalogSettings) -> Result<CatalogSettings, LoadError> {
    let path = catalog
        .path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG_PATH));
    if path.as_os_str().is_empty() {
        return Err(LoadError::invalid("catalog.path", "path must not be empty"));
    }

    Ok(CatalogSettings { path })
}

fn build_scheduler_settings(
    scheduler: RawSchedulerSettings,
) -> Result<SchedulerSettings, LoadError> {
    let worker_capacity = non_zero_u32(
        scheduler.worker_capacity.unwrap_or(DEFAULT_WORKER_CAPACITY),
        "scheduler.worker_capacity",
    )?;

    let retry_base = positive_secs(
        scheduler.retry_base_seconds,
        DEFAULT_RETRY_BASE_SECS,
        "scheduler.retry_base_seconds",
    )?;
    let retry_cap = positive_secs(
        scheduler.retry_cap_seconds,
        DEFAULT_RETRY_CAP_SECS,
        "scheduler.retry_cap_seconds",
    )?;
    if retry_cap < retry_base {
        return Err(LoadError::invalid(
            "scheduler.retry_cap_seconds",
            "must not be smaller than scheduler.retry_base_seconds",
        ));
    }

    Ok(SchedulerSettings {
        worker_capacity,
        scan_period: positive_secs(
            scheduler.scan_period_seconds,
            DEFAULT_SCAN_PERIOD_SECS,
            "scheduler.scan_period_seconds",
        )?,
        reload_period: positive_secs(
            scheduler.reload_period_seconds,
            DEFAULT_RELOAD_PERIOD_SECS,
            "scheduler.reload_period_seconds",
        )?,
        retry_base,
        retry_cap,
        refresh_timeout: positive_secs(
            scheduler.refresh_timeout_seconds,
            DEFAULT_REFRESH_TIMEOUT_SECS,
            "scheduler.refresh_timeout_seconds",
        )?,
        reload_timeout: positive_secs(
            scheduler.reload_timeout_seconds,
            DEFAULT_RELOAD_TIMEOUT_SECS,
            "scheduler.reload_timeout_seconds",
        )?,
        default_interval: positive_secs(
            scheduler.default_interval_seconds,
            DEFAULT_INTERVAL_SECS,
            "scheduler.default_interval_seconds",
        )?,
    })
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let user_agent = upstream
        .user_agent
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
    if user_agent.is_empty() {
        return Err(LoadError::invalid(
            "upstream.user_agent",
            "must not be empty",
        ));
    }

    let request_timeout = positive_secs(
        upstream.request_timeout_seconds,
        DEFAULT_REQUEST_TIMEOUT_SECS,
        "upstream.request_timeout_seconds",
    )?;

    Ok(UpstreamSettings {
        user_agent,
        request_timeout,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCatalogSettings {
    path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSchedulerSettings {
    worker_capacity: Option<u64>,
    scan_period_seconds: Option<u64>,
    reload_period_seconds: Option<u64>,
    retry_base_seconds: Option<u64>,
    retry_cap_seconds: Option<u64>,
    refresh_timeout_seconds: Option<u64>,
    reload_timeout_seconds: Option<u64>,
    default_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    user_agent: Option<String>,
    request_timeout_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn positive_secs(
    value: Option<u64>,
    default: u64,
    key: &'static str,
) -> Result<Duration, LoadError> {
    match value.unwrap_or(default) {
        0 => Err(LoadError::invalid(key, "must be greater than zero")),
        seconds => Ok(Duration::from_secs(seconds)),
    }
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
