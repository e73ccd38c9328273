//! JetStream adapter for the broker seam.
//!
//! An exchange becomes a stream named after it that captures `<exchange>.>`;
//! a routing key becomes the subject `<exchange>.<routing_key>`; a queue
//! becomes a durable pull consumer named after the queue, with explicit acks
//! and a filter on its binding subject. Stream storage is `File` for durable
//! exchanges.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_nats::jetstream::{self, AckKind, consumer::AckPolicy, consumer::pull, stream};
use async_nats::{Client, ConnectOptions, HeaderMap};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::util::lock::mutex_lock;

use super::topology::{ExchangeDeclaration, ExchangeKind, QueueBinding, QueueDeclaration};
use super::transport::{
    Acker, Broker, BrokerChannel, Delivery, DeliveryStream, Publishing, QueueError,
};

const SOURCE: &str = "queue::nats";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CONTENT_TYPE_HEADER: &str = "Content-Type";

/// Subject a message published to `exchange` under `routing_key` travels on.
pub fn subject_for(exchange: &str, routing_key: &str) -> String {
    format!("{exchange}.{routing_key}")
}

fn stream_subjects(exchange: &str) -> Vec<String> {
    vec![format!("{exchange}.>")]
}

fn storage_for(durable: bool) -> stream::StorageType {
    if durable {
        stream::StorageType::File
    } else {
        stream::StorageType::Memory
    }
}

#[derive(Clone)]
pub struct NatsBroker {
    client: Client,
    /// Queue name to the exchange (stream) its consumer lives on.
    bound_streams: Arc<DashMap<String, String>>,
}

impl NatsBroker {
    pub async fn connect(url: &str, connection_name: &str) -> Result<Self, QueueError> {
        info!(url, "Connecting to NATS");
        let client = ConnectOptions::new()
            .name(connection_name)
            .connection_timeout(CONNECT_TIMEOUT)
            .connect(url)
            .await
            .map_err(|err| QueueError::Connection(err.to_string()))?;
        info!(url, "Connected to NATS");

        Ok(Self {
            client,
            bound_streams: Arc::new(DashMap::new()),
        })
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, QueueError> {
        let (closed, _) = watch::channel(false);
        Ok(Box::new(NatsChannel {
            jetstream: jetstream::new(self.client.clone()),
            bound_streams: self.bound_streams.clone(),
            declared_queues: Mutex::new(HashMap::new()),
            closed,
        }))
    }
}

struct NatsChannel {
    jetstream: jetstream::Context,
    bound_streams: Arc<DashMap<String, String>>,
    /// Queues declared on this channel and not yet bound.
    declared_queues: Mutex<HashMap<String, QueueDeclaration>>,
    closed: watch::Sender<bool>,
}

impl NatsChannel {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if *self.closed.borrow() {
            return Err(QueueError::ChannelClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for NatsChannel {
    async fn declare_exchange(&self, exchange: &ExchangeDeclaration) -> Result<(), QueueError> {
        self.ensure_open()?;
        if exchange.kind != ExchangeKind::Direct {
            return Err(QueueError::Declare(format!(
                "exchange kind `{}` is not supported on JetStream",
                exchange.kind.as_str()
            )));
        }
        if exchange.auto_delete {
            return Err(QueueError::Declare(
                "auto-delete exchanges are not supported on JetStream".to_string(),
            ));
        }

        let storage = storage_for(exchange.durable);
        let subjects = stream_subjects(&exchange.name);
        let stream = self
            .jetstream
            .get_or_create_stream(stream::Config {
                name: exchange.name.clone(),
                subjects: subjects.clone(),
                storage,
                ..Default::default()
            })
            .await
            .map_err(|err| QueueError::Declare(format!("stream `{}`: {err}", exchange.name)))?;

        let existing = &stream.cached_info().config;
        if existing.storage != storage {
            return Err(QueueError::conflict(
                format!("exchange {}", exchange.name),
                format!("stream storage is {:?}, requested {storage:?}", existing.storage),
            ));
        }
        if existing.subjects != subjects {
            return Err(QueueError::conflict(
                format!("exchange {}", exchange.name),
                format!("stream captures {:?}, requested {subjects:?}", existing.subjects),
            ));
        }

        debug!(stream = %exchange.name, "JetStream stream ready");
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueDeclaration) -> Result<(), QueueError> {
        self.ensure_open()?;
        if !queue.durable || queue.exclusive || queue.auto_delete {
            return Err(QueueError::Declare(format!(
                "queue `{}` must be durable, shared and persistent on JetStream",
                queue.name
            )));
        }
        // The durable consumer needs its stream, which is only known at bind time.
        mutex_lock(&self.declared_queues, SOURCE, "declare_queue")
            .insert(queue.name.clone(), queue.clone());
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), QueueError> {
        self.ensure_open()?;
        let known = mutex_lock(&self.declared_queues, SOURCE, "bind_queue")
            .contains_key(&binding.queue);
        if !known && !self.bound_streams.contains_key(&binding.queue) {
            return Err(QueueError::Declare(format!(
                "queue `{}` must be declared before binding",
                binding.queue
            )));
        }

        let stream = self
            .jetstream
            .get_stream(&binding.exchange)
            .await
            .map_err(|err| QueueError::Declare(format!("stream `{}`: {err}", binding.exchange)))?;

        let filter_subject = subject_for(&binding.exchange, &binding.routing_key);
        let consumer = stream
            .get_or_create_consumer(
                &binding.queue,
                pull::Config {
                    durable_name: Some(binding.queue.clone()),
                    ack_policy: AckPolicy::Explicit,
                    filter_subject: filter_subject.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| QueueError::Declare(format!("consumer `{}`: {err}", binding.queue)))?;

        let existing = &consumer.cached_info().config.filter_subject;
        if *existing != filter_subject {
            return Err(QueueError::conflict(
                format!("queue {}", binding.queue),
                format!("bound to `{existing}`, requested `{filter_subject}`"),
            ));
        }

        self.bound_streams
            .insert(binding.queue.clone(), binding.exchange.clone());
        mutex_lock(&self.declared_queues, SOURCE, "bind_queue").remove(&binding.queue);
        debug!(queue = %binding.queue, subject = %filter_subject, "JetStream consumer ready");
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: Publishing,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        let subject = subject_for(exchange, routing_key);
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE_HEADER, publishing.content_type);

        // The returned ack future resolves once the stream has stored the message.
        let ack = self
            .jetstream
            .publish_with_headers(subject, headers, publishing.body)
            .await
            .map_err(|err| QueueError::Publish(err.to_string()))?;
        ack.await
            .map_err(|err| QueueError::Publish(err.to_string()))?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn DeliveryStream>, QueueError> {
        self.ensure_open()?;
        let exchange = self
            .bound_streams
            .get(queue)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                QueueError::Subscribe(format!("queue `{queue}` is not bound to an exchange"))
            })?;

        let stream = self
            .jetstream
            .get_stream(&exchange)
            .await
            .map_err(|err| QueueError::Subscribe(err.to_string()))?;
        let consumer: jetstream::consumer::Consumer<pull::Config> = stream
            .get_consumer(queue)
            .await
            .map_err(|err| QueueError::Subscribe(err.to_string()))?;
        let messages = consumer
            .messages()
            .await
            .map_err(|err| QueueError::Subscribe(err.to_string()))?;

        debug!(queue, consumer_tag, "JetStream subscription started");
        Ok(Box::new(NatsDeliveries {
            messages,
            closed: self.closed.subscribe(),
        }))
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }
}

struct NatsDeliveries {
    messages: pull::Stream,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl DeliveryStream for NatsDeliveries {
    async fn next(&mut self) -> Option<Result<Delivery, QueueError>> {
        if *self.closed.borrow_and_update() {
            return None;
        }

        let next = tokio::select! {
            next = self.messages.next() => next?,
            _ = self.closed.changed() => return None,
        };

        Some(
            next.map(|message| {
                let redelivered = message
                    .info()
                    .map(|info| info.delivered > 1)
                    .unwrap_or(false);
                let body = message.payload.clone();
                Delivery::new(body, redelivered, Box::new(NatsAcker { message }))
            })
            .map_err(|err| QueueError::Subscribe(err.to_string())),
        )
    }
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        self.message
            .ack()
            .await
            .map_err(|err| QueueError::Acknowledge(err.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), QueueError> {
        let kind = if requeue { AckKind::Nak(None) } else { AckKind::Term };
        self.message
            .ack_with(kind)
            .await
            .map_err(|err| QueueError::Acknowledge(err.to_string()))
    }
}
