//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    str::FromStr,
    time::Duration,
};

use clap::{Parser, ValueEnum};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::domain::posts::DEFAULT_FEED_LENGTH_CAP;

mod cli;

pub use cli::{BrokerOverrides, CliArgs, Command, DeclareTopologyArgs, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "murmur";
const ENV_PREFIX: &str = "MURMUR";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_BROKER_URL: &str = "nats://127.0.0.1:4222";
const DEFAULT_BROKER_CONNECTION_NAME: &str = "murmur";
const DEFAULT_EXCHANGE: &str = "feed";
const DEFAULT_QUEUE: &str = "feed-updates";
const DEFAULT_ROUTING_KEY: &str = "post.created";
const DEFAULT_FEED_WORKERS: u64 = 2;
const DEFAULT_CACHE_CAPACITY: u64 = 10_000;
const DEFAULT_WARM_QUEUE_LIMIT: u64 = 1024;
const DEFAULT_OUTBOUND_BUFFER: u64 = 64;
const DEFAULT_CONTROL_BUFFER: u64 = 256;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub broker: BrokerSettings,
    pub feed: FeedSettings,
    pub realtime: RealtimeSettings,
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
pub struct DatabaseSettings {
    /// Postgres URL; without one the service runs on the in-memory store.
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    Nats,
    Memory,
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub backend: BrokerBackend,
    pub url: String,
    pub connection_name: String,
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub workers: NonZeroUsize,
    pub length_cap: NonZeroUsize,
    pub cache_capacity: NonZeroUsize,
    pub warm_queue_limit: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    pub outbound_buffer: NonZeroUsize,
    pub control_buffer: NonZeroUsize,
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

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::DeclareTopology(args)) => raw.apply_broker_overrides(&args.broker),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    broker: RawBrokerSettings,
    feed: RawFeedSettings,
    realtime: RawRealtimeSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_broker_overrides(&overrides.broker);
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
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(count) = overrides.database_max_connections {
            self.database.max_connections = Some(count);
        }
        if let Some(count) = overrides.feed_workers {
            self.feed.workers = Some(count);
        }
        if let Some(count) = overrides.feed_length_cap {
            self.feed.length_cap = Some(count);
        }
        if let Some(count) = overrides.feed_cache_capacity {
            self.feed.cache_capacity = Some(count);
        }
        if let Some(count) = overrides.realtime_outbound_buffer {
            self.realtime.outbound_buffer = Some(count);
        }
    }

    fn apply_broker_overrides(&mut self, overrides: &BrokerOverrides) {
        if let Some(backend) = overrides.broker_backend {
            self.broker.backend = Some(backend);
        }
        if let Some(url) = overrides.broker_url.as_ref() {
            self.broker.url = Some(url.clone());
        }
        if let Some(exchange) = overrides.broker_exchange.as_ref() {
            self.broker.exchange = Some(exchange.clone());
        }
        if let Some(queue) = overrides.broker_queue.as_ref() {
            self.broker.queue = Some(queue.clone());
        }
        if let Some(key) = overrides.broker_routing_key.as_ref() {
            self.broker.routing_key = Some(key.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        Ok(Self {
            server: build_server_settings(raw.server)?,
            logging: build_logging_settings(raw.logging)?,
            database: build_database_settings(raw.database)?,
            broker: build_broker_settings(raw.broker)?,
            feed: build_feed_settings(raw.feed)?,
            realtime: build_realtime_settings(raw.realtime)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    let addr =
        parse_socket_addr(&host, port).map_err(|reason| LoadError::invalid("server.host", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
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

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_broker_settings(broker: RawBrokerSettings) -> Result<BrokerSettings, LoadError> {
    let url = broker
        .url
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_BROKER_URL.to_string());

    let exchange = broker
        .exchange
        .unwrap_or_else(|| DEFAULT_EXCHANGE.to_string());
    validate_broker_name(&exchange, "broker.exchange")?;

    let queue = broker.queue.unwrap_or_else(|| DEFAULT_QUEUE.to_string());
    validate_broker_name(&queue, "broker.queue")?;

    let routing_key = broker
        .routing_key
        .unwrap_or_else(|| DEFAULT_ROUTING_KEY.to_string());
    validate_routing_key(&routing_key)?;

    Ok(BrokerSettings {
        backend: broker.backend.unwrap_or(BrokerBackend::Nats),
        url,
        connection_name: broker
            .connection_name
            .unwrap_or_else(|| DEFAULT_BROKER_CONNECTION_NAME.to_string()),
        exchange,
        queue,
        routing_key,
    })
}

fn build_feed_settings(feed: RawFeedSettings) -> Result<FeedSettings, LoadError> {
    Ok(FeedSettings {
        workers: non_zero_usize(feed.workers.unwrap_or(DEFAULT_FEED_WORKERS), "feed.workers")?,
        length_cap: non_zero_usize(
            feed.length_cap.unwrap_or(DEFAULT_FEED_LENGTH_CAP as u64),
            "feed.length_cap",
        )?,
        cache_capacity: non_zero_usize(
            feed.cache_capacity.unwrap_or(DEFAULT_CACHE_CAPACITY),
            "feed.cache_capacity",
        )?,
        warm_queue_limit: non_zero_usize(
            feed.warm_queue_limit.unwrap_or(DEFAULT_WARM_QUEUE_LIMIT),
            "feed.warm_queue_limit",
        )?,
    })
}

fn build_realtime_settings(realtime: RawRealtimeSettings) -> Result<RealtimeSettings, LoadError> {
    Ok(RealtimeSettings {
        outbound_buffer: non_zero_usize(
            realtime.outbound_buffer.unwrap_or(DEFAULT_OUTBOUND_BUFFER),
            "realtime.outbound_buffer",
        )?,
        control_buffer: non_zero_usize(
            realtime.control_buffer.unwrap_or(DEFAULT_CONTROL_BUFFER),
            "realtime.control_buffer",
        )?,
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
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBrokerSettings {
    backend: Option<BrokerBackend>,
    url: Option<String>,
    connection_name: Option<String>,
    exchange: Option<String>,
    queue: Option<String>,
    routing_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawFeedSettings {
    workers: Option<u64>,
    length_cap: Option<u64>,
    cache_capacity: Option<u64>,
    warm_queue_limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRealtimeSettings {
    outbound_buffer: Option<u64>,
    control_buffer: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value_usize: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value_usize)
        .ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Exchange and queue names double as JetStream stream and consumer names.
fn validate_broker_name(name: &str, key: &'static str) -> Result<(), LoadError> {
    if name.is_empty() {
        return Err(LoadError::invalid(key, "must not be empty"));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>'))
    {
        return Err(LoadError::invalid(
            key,
            format!("must not contain `{bad}`"),
        ));
    }
    Ok(())
}

fn validate_routing_key(key: &str) -> Result<(), LoadError> {
    const KEY: &str = "broker.routing_key";
    if key.is_empty() || key.starts_with('.') || key.ends_with('.') || key.contains("..") {
        return Err(LoadError::invalid(
            KEY,
            "must be one or more dot-separated tokens",
        ));
    }
    if let Some(bad) = key
        .chars()
        .find(|c| c.is_whitespace() || matches!(c, '*' | '>'))
    {
        return Err(LoadError::invalid(KEY, format!("must not contain `{bad}`")));
    }
    Ok(())
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
