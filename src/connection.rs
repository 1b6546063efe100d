// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Topology Manager
//!
//! This module owns the physical side of the transport: one lazily
//! established, persistent connection with a single channel multiplexed
//! across every declared exchange and queue. Declarations are durable,
//! idempotent and cached by name for the lifetime of the manager, so
//! repeating them is always safe and never hits the broker twice.
//!
//! For a reliable queue `Q` the topology forms a closed retry loop driven
//! entirely by dead-lettering: `Q` dead-letters rejected messages to the
//! topic exchange `Q.dlx` under the `wait` key, which routes them into
//! `Q.wait`; there the per-message TTL expires and dead-letters them back to
//! `Q.dlx` under the `retry` key, which routes them into `Q` again. Messages
//! that exhausted their retries are published to `Q.dlx` under the
//! `parkinglot` key and end up in `Q.pl` for manual inspection.

use crate::{
    config::{ConnectionOptions, ReceiverOptions},
    envelope::split_event_type,
    errors::TransportError,
    message::WireMessage,
};
use lapin::{
    message::BasicGetMessage,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex},
};
use tracing::{debug, error};

/// Suffix of the dead-letter exchange derived from a queue name
pub const DLX_SUFFIX: &str = ".dlx";
/// Suffix of the wait queue derived from a queue name
pub const WAIT_SUFFIX: &str = ".wait";
/// Suffix of the parking-lot queue derived from a queue name
pub const PARKING_LOT_SUFFIX: &str = ".pl";
/// Routing key that sends a message from the dead-letter exchange back to
/// the main queue
pub const RETRY_ROUTING_KEY: &str = "retry";
/// Routing key that sends a rejected message into the wait queue
pub const WAIT_ROUTING_KEY: &str = "wait";
/// Routing key that quarantines a message in the parking lot
pub const PARKING_LOT_ROUTING_KEY: &str = "parkinglot";

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Manager of one broker connection, its channel and the declared topology.
///
/// The manager never reconnects on its own: a lost connection surfaces as
/// `BrokerUnavailable` from the failing operation and the next use dials
/// again lazily. It is not designed for concurrent use from multiple tasks
/// without external synchronization.
pub struct AmqpConnection {
    options: ConnectionOptions,
    state: tokio::sync::Mutex<Option<(Arc<Connection>, Arc<Channel>)>>,
    declared_exchanges: Mutex<HashSet<String>>,
    declared_queues: Mutex<HashSet<String>>,
    prefetch_count: Mutex<Option<u16>>,
}

impl AmqpConnection {
    /// Creates a manager for the given broker. No connection is made until
    /// the first operation needs one.
    pub fn new(options: ConnectionOptions) -> Arc<AmqpConnection> {
        Arc::new(AmqpConnection {
            options,
            state: tokio::sync::Mutex::new(None),
            declared_exchanges: Mutex::new(HashSet::default()),
            declared_queues: Mutex::new(HashSet::default()),
            prefetch_count: Mutex::new(None),
        })
    }

    /// Sets the prefetch count applied to the channel when it is created.
    pub fn set_quality_of_service(&self, prefetch_count: u16) {
        *self.prefetch_count.lock().unwrap() = Some(prefetch_count);
    }

    /// Returns the channel, dialing the broker first if necessary.
    async fn channel(&self) -> Result<Arc<Channel>, TransportError> {
        let mut state = self.state.lock().await;

        if let Some((connection, channel)) = state.as_ref() {
            if connection.status().connected() {
                return Ok(channel.clone());
            }
        }

        debug!("creating amqp connection...");
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.options.name.clone()));

        let connection = match Connection::connect(&self.options.uri(), properties).await {
            Ok(connection) => connection,
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                return Err(TransportError::BrokerUnavailable);
            }
        };
        debug!("amqp connected");

        debug!("creating amqp channel...");
        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                return Err(TransportError::ChannelError);
            }
        };
        debug!("channel created");

        let prefetch_count = *self.prefetch_count.lock().unwrap();
        if let Some(count) = prefetch_count {
            if let Err(err) = channel.basic_qos(count, BasicQosOptions::default()).await {
                error!(error = err.to_string(), "failure to configure qos");
                return Err(TransportError::QoSDeclarationError(err.to_string()));
            }
        }

        let channel = Arc::new(channel);
        *state = Some((Arc::new(connection), channel.clone()));

        Ok(channel)
    }

    /// Publishes an encoded message to a declared exchange.
    pub async fn publish(
        &self,
        message: &WireMessage,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        let channel = self.channel().await?;

        match channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                message.body(),
                message.properties().clone(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(TransportError::PublishingError(exchange.to_owned()))
            }
            _ => Ok(()),
        }
    }

    /// Polls the queue once, without blocking for a delivery.
    pub async fn get(&self, queue: &str) -> Result<Option<BasicGetMessage>, TransportError> {
        let channel = self.channel().await?;

        match channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
        {
            Ok(message) => Ok(message),
            Err(err) => {
                error!(error = err.to_string(), "error fetching message");
                Err(TransportError::ConsumerError(queue.to_owned()))
            }
        }
    }

    /// Starts a consumer delivering the queue's messages continuously.
    pub async fn fetch(&self, queue: &str) -> Result<Consumer, TransportError> {
        let channel = self.channel().await?;

        match channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => Ok(consumer),
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(TransportError::ConsumerError(queue.to_owned()))
            }
        }
    }

    /// Acknowledges one delivery by its tag.
    pub async fn ack(&self, queue: &str, delivery_tag: u64) -> Result<(), TransportError> {
        let channel = self.channel().await?;

        match channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error whiling ack msg");
                Err(TransportError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    /// Negatively acknowledges one delivery by its tag. With
    /// `requeue = false` the broker dead-letters the message, which is what
    /// feeds the retry loop.
    pub async fn nack(
        &self,
        queue: &str,
        delivery_tag: u64,
        requeue: bool,
    ) -> Result<(), TransportError> {
        let channel = self.channel().await?;

        match channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error whiling nack msg");
                Err(TransportError::NackMessageError)
            }
            _ => Ok(()),
        }
    }

    /// Declares the topology and the event bindings for a reliable queue,
    /// each gated by its receiver option flag.
    pub async fn setup(
        &self,
        registered_events: &[String],
        options: &ReceiverOptions,
    ) -> Result<(), TransportError> {
        if options.setup_topology {
            self.setup_topology(&options.queue, options.min_retry_backoff)
                .await?;
        }

        if options.setup_bindings {
            self.setup_bindings(registered_events, &options.queue).await?;
        }

        Ok(())
    }

    /// Declares the four broker objects of the retry loop: the main queue,
    /// the TTL'd wait queue, the parking lot and the topic dead-letter
    /// exchange binding all three.
    pub async fn setup_topology(
        &self,
        queue_name: &str,
        min_retry_backoff: u32,
    ) -> Result<(), TransportError> {
        let channel = self.channel().await?;

        let dlx_exchange = format!("{queue_name}{DLX_SUFFIX}");
        let wait_queue = format!("{queue_name}{WAIT_SUFFIX}");
        let parking_lot_queue = format!("{queue_name}{PARKING_LOT_SUFFIX}");

        self.declare_exchange(&channel, &dlx_exchange, ExchangeKind::Topic)
            .await?;

        let mut wait_args = BTreeMap::new();
        wait_args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(dlx_exchange.clone())),
        );
        wait_args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(RETRY_ROUTING_KEY)),
        );
        wait_args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(min_retry_backoff as i32)),
        );
        self.declare_queue(&channel, &wait_queue, wait_args).await?;

        self.declare_queue(&channel, &parking_lot_queue, BTreeMap::new())
            .await?;

        let mut queue_args = BTreeMap::new();
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(dlx_exchange.clone())),
        );
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(WAIT_ROUTING_KEY)),
        );
        self.declare_queue(&channel, queue_name, queue_args).await?;

        self.bind_queue(&channel, &wait_queue, &dlx_exchange, WAIT_ROUTING_KEY)
            .await?;
        self.bind_queue(&channel, queue_name, &dlx_exchange, RETRY_ROUTING_KEY)
            .await?;
        self.bind_queue(
            &channel,
            &parking_lot_queue,
            &dlx_exchange,
            PARKING_LOT_ROUTING_KEY,
        )
        .await?;

        Ok(())
    }

    /// Binds the incoming queue to the fanout exchange of every registered
    /// event type, declaring the exchange first so the binding always
    /// succeeds.
    pub async fn setup_bindings(
        &self,
        registered_events: &[String],
        incoming_queue: &str,
    ) -> Result<(), TransportError> {
        let channel = self.channel().await?;

        for event_type in registered_events {
            let (exchange_name, event_name) = split_event_type(event_type)?;

            self.declare_exchange(&channel, exchange_name, ExchangeKind::Fanout)
                .await?;
            self.bind_queue(&channel, incoming_queue, exchange_name, event_name)
                .await?;
        }

        Ok(())
    }

    async fn declare_exchange(
        &self,
        channel: &Channel,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<(), TransportError> {
        if self.declared_exchanges.lock().unwrap().contains(name) {
            return Ok(());
        }

        debug!("creating exchange: {}", name);

        match channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: true,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name, "error to declare the exchange"
                );
                Err(TransportError::DeclareExchangeError(name.to_owned()))
            }
            _ => {
                debug!("exchange: {} was created", name);
                self.declared_exchanges.lock().unwrap().insert(name.to_owned());
                Ok(())
            }
        }
    }

    async fn declare_queue(
        &self,
        channel: &Channel,
        name: &str,
        args: BTreeMap<ShortString, AMQPValue>,
    ) -> Result<(), TransportError> {
        if self.declared_queues.lock().unwrap().contains(name) {
            return Ok(());
        }

        debug!("creating queue: {}", name);

        match channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::from(args),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(TransportError::DeclareQueueError(name.to_owned()))
            }
            _ => {
                debug!("queue: {} was created", name);
                self.declared_queues.lock().unwrap().insert(name.to_owned());
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        channel: &Channel,
        queue_name: &str,
        exchange_name: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue_name, exchange_name, routing_key
        );

        match channel
            .queue_bind(
                queue_name,
                exchange_name,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(TransportError::BindQueueError(
                    queue_name.to_owned(),
                    exchange_name.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }
}
