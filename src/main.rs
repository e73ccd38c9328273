use std::{process, sync::Arc};

use murmur::{
    application::{
        error::AppError,
        feed::FeedService,
        posts::PostOrchestrator,
        repos::{PostStore, UserStore},
    },
    cache::{CacheConfig, CacheWarmer, FeedCache},
    config::{self, BrokerBackend, BrokerSettings, Settings},
    infra::{
        db::PostgresRepositories,
        error::InfraError,
        http::{self, HttpState},
        memory::MemoryStore,
        telemetry,
    },
    queue::{
        Broker, FeedConsumerPool, FeedProducer, FeedTopology, FeedUpdateHandler, MemoryBroker,
        NatsBroker,
    },
    realtime::pool::ConnectionPool,
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
        config::Command::DeclareTopology(_) => run_declare_topology(settings).await,
    }
}

struct Stores {
    posts: Arc<dyn PostStore>,
    users: Arc<dyn UserStore>,
}

async fn init_stores(settings: &Settings) -> Result<Stores, AppError> {
    let length_cap = settings.feed.length_cap.get();

    let Some(database_url) = settings.database.url.as_ref() else {
        warn!("No database url configured; serving from the in-memory store");
        let store = Arc::new(MemoryStore::new().with_feed_limit(length_cap));
        return Ok(Stores {
            posts: store.clone(),
            users: store,
        });
    };

    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;
    let repositories = Arc::new(PostgresRepositories::new(pool).with_feed_limit(length_cap));

    Ok(Stores {
        posts: repositories.clone(),
        users: repositories,
    })
}

async fn connect_broker(settings: &BrokerSettings) -> Result<Arc<dyn Broker>, AppError> {
    match settings.backend {
        BrokerBackend::Nats => {
            let broker = NatsBroker::connect(&settings.url, &settings.connection_name)
                .await
                .map_err(InfraError::from)?;
            Ok(Arc::new(broker))
        }
        BrokerBackend::Memory => {
            warn!("Using the in-memory broker; queued updates do not survive a restart");
            Ok(Arc::new(MemoryBroker::new()))
        }
    }
}

async fn declare_topology(broker: &dyn Broker, topology: &FeedTopology) -> Result<(), AppError> {
    let channel = broker.open_channel().await.map_err(InfraError::from)?;
    let declared = topology.declare(channel.as_ref()).await;
    channel.close().await;
    declared.map_err(|err| AppError::from(InfraError::from(err)))
}

async fn run_declare_topology(settings: Settings) -> Result<(), AppError> {
    let broker = connect_broker(&settings.broker).await?;
    let topology = FeedTopology::from(&settings.broker);
    declare_topology(broker.as_ref(), &topology).await
}

async fn run_serve(settings: Settings) -> Result<(), AppError> {
    let stores = init_stores(&settings).await?;
    let broker = connect_broker(&settings.broker).await?;
    let topology = FeedTopology::from(&settings.broker);
    declare_topology(broker.as_ref(), &topology).await?;

    let producer = Arc::new(
        FeedProducer::connect(broker.as_ref(), &topology)
            .await
            .map_err(InfraError::from)?,
    );

    let cache_config = CacheConfig::from(&settings.feed);
    let cache = Arc::new(FeedCache::new(&cache_config));
    let warmer = Arc::new(CacheWarmer::spawn(cache.clone(), &cache_config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (pool, connections) =
        ConnectionPool::with_buffer(settings.realtime.control_buffer.get(), shutdown_rx.clone());
    let pool_task = pool.spawn();

    let handler = Arc::new(
        FeedUpdateHandler::new(cache.clone(), stores.posts.clone(), stores.users.clone())
            .with_notifier(connections.clone()),
    );
    let consumers = match FeedConsumerPool::start(
        broker.as_ref(),
        &topology,
        settings.feed.workers.get(),
        handler,
        shutdown_rx.clone(),
    )
    .await
    {
        Ok(consumers) => consumers,
        Err(err) => {
            let _ = shutdown_tx.send(true);
            let _ = pool_task.await;
            warmer.shutdown().await;
            producer.close().await;
            return Err(InfraError::from(err).into());
        }
    };

    let state = HttpState {
        feeds: Arc::new(FeedService::new(
            cache.clone(),
            stores.posts.clone(),
            warmer.clone(),
            settings.feed.length_cap.get(),
        )),
        posts: Arc::new(PostOrchestrator::new(stores.posts.clone(), producer.clone())),
        users: stores.users.clone(),
        connections,
        outbound_buffer: settings.realtime.outbound_buffer.get(),
    };

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let result = serve_http(&settings, state, shutdown_rx).await;

    consumers.join().await;
    if let Err(err) = pool_task.await {
        warn!(error = %err, "Connection pool task ended abnormally");
    }
    warmer.shutdown().await;
    producer.close().await;
    info!("Shutdown complete");

    result
}

async fn serve_http(
    settings: &Settings,
    state: HttpState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), AppError> {
    let router = http::build_router(state);
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(addr = %settings.server.addr, "HTTP server listening");

    let mut server_shutdown = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    tokio::select! {
        joined = &mut server => return server_result(joined),
        _ = shutdown.wait_for(|stop| *stop) => {}
    }

    match tokio::time::timeout(settings.server.graceful_shutdown, &mut server).await {
        Ok(joined) => server_result(joined),
        Err(_) => {
            warn!(
                timeout_secs = settings.server.graceful_shutdown.as_secs(),
                "Graceful shutdown timed out; dropping open connections"
            );
            server.abort();
            Ok(())
        }
    }
}

fn server_result(
    joined: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), AppError> {
    match joined {
        Ok(result) => result.map_err(|err| AppError::unexpected(format!("server error: {err}"))),
        Err(err) => Err(AppError::unexpected(format!("server task failed: {err}"))),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown requested");
}
