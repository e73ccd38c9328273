use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

use super::BrokerBackend;

/// Command-line arguments for the murmur binary.
#[derive(Debug, Parser)]
#[command(name = "murmur", version, about = "Feed-update distribution service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "MURMUR_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP/WebSocket service and the feed consumer pool.
    Serve(Box<ServeArgs>),
    /// Declare the broker exchange, queue and binding, then exit.
    #[command(name = "declare-topology")]
    DeclareTopology(DeclareTopologyArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct DeclareTopologyArgs {
    #[command(flatten)]
    pub broker: BrokerOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct BrokerOverrides {
    /// Override the broker backend (nats|memory).
    #[arg(long = "broker-backend", value_name = "BACKEND", value_enum)]
    pub broker_backend: Option<BrokerBackend>,

    /// Override the broker connection URL.
    #[arg(long = "broker-url", value_name = "URL")]
    pub broker_url: Option<String>,

    /// Override the feed-update exchange name.
    #[arg(long = "broker-exchange", value_name = "NAME")]
    pub broker_exchange: Option<String>,

    /// Override the feed-update queue name.
    #[arg(long = "broker-queue", value_name = "NAME")]
    pub broker_queue: Option<String>,

    /// Override the routing key binding the queue to the exchange.
    #[arg(long = "broker-routing-key", value_name = "KEY")]
    pub broker_routing_key: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub broker: BrokerOverrides,

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

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Override the number of feed consumer workers.
    #[arg(long = "feed-workers", value_name = "COUNT")]
    pub feed_workers: Option<u64>,

    /// Override the maximum number of posts served per feed.
    #[arg(long = "feed-length-cap", value_name = "COUNT")]
    pub feed_length_cap: Option<u64>,

    /// Override the number of feeds kept in the cache.
    #[arg(long = "feed-cache-capacity", value_name = "COUNT")]
    pub feed_cache_capacity: Option<u64>,

    /// Override the per-connection outbound queue size.
    #[arg(long = "realtime-outbound-buffer", value_name = "COUNT")]
    pub realtime_outbound_buffer: Option<u64>,
}
