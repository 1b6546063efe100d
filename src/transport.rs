// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reliable Transport
//!
//! This module composes the codec and the topology manager into the
//! at-least-once transport: publish by event type, single-poll and blocking
//! receive, acknowledgement, and the retry escalation that ends in the
//! parking lot.
//!
//! The retry state is kept entirely by the broker. A rejected message is
//! nacked without requeue, dead-letters into the wait queue, sits out the
//! configured backoff and re-enters the main queue; the broker's `x-death`
//! header records how often that happened. Once the recorded count reaches
//! the configured maximum, or when the caller rejects without requeue, the
//! message is published to the parking lot and the original delivery is
//! acknowledged so it leaves the main queue for good.

use crate::{
    config::ReceiverOptions,
    connection::{AmqpConnection, DLX_SUFFIX, PARKING_LOT_ROUTING_KEY},
    encoding::Encoder,
    envelope::{split_event_type, Envelope},
    errors::TransportError,
    handler::EnvelopeHandler,
    message::WireMessage,
    otel,
};
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    types::{AMQPValue, FieldTable},
};
use opentelemetry::{global, trace::Span};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, warn};

/// Marker under which a received envelope carries its delivery tag
pub const MARKER_AMQP_DELIVERY_TAG: &str = "amqp_delivery_tag";

/// Constant for the x-death header used in the broker's dead-lettering
/// mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the header naming the queue a message first died on
pub const AMQP_HEADERS_FIRST_DEATH_QUEUE: &str = "x-first-death-queue";
/// Constant for the count field in an x-death entry
pub const AMQP_HEADERS_COUNT: &str = "count";
/// Constant for the queue field in an x-death entry
pub const AMQP_HEADERS_QUEUE: &str = "queue";

/// At-least-once transport over one queue of the broker.
pub struct AmqpTransport {
    connection: Arc<AmqpConnection>,
    encoder: Encoder,
    options: ReceiverOptions,
}

impl AmqpTransport {
    /// Creates a transport over the given connection and receiver options.
    ///
    /// The options are validated here, once; the prefetch count is handed to
    /// the connection so it is applied when the channel comes up.
    ///
    /// # Returns
    /// An Arc-wrapped transport, or `InvalidOptions` when the options do not
    /// name a queue.
    pub fn new(
        connection: Arc<AmqpConnection>,
        encoder: Encoder,
        options: ReceiverOptions,
    ) -> Result<Arc<AmqpTransport>, TransportError> {
        if options.queue.is_empty() {
            return Err(TransportError::InvalidOptions(
                "queue name must not be empty".to_owned(),
            ));
        }

        connection.set_quality_of_service(options.prefetch_count);

        Ok(Arc::new(AmqpTransport {
            connection,
            encoder,
            options,
        }))
    }

    /// Publishes an envelope to the exchange and routing key derived from
    /// its event type.
    ///
    /// # Returns
    /// Ok(()) on success, `EncodingFailed` when the envelope cannot be
    /// encoded, or a broker error from the publish itself.
    pub async fn publish(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let (exchange, routing_key) = split_event_type(envelope.metadata().event_type())?;

        let message = self.encoder.encode(envelope)?;
        let message = with_trace_context(message);

        debug!(
            "publishing: {} - exchange: {}",
            envelope.metadata().event_type(),
            exchange
        );

        self.connection.publish(&message, exchange, routing_key).await
    }

    /// Polls the queue once and decodes the pending message, if any.
    ///
    /// The returned envelope carries the raw broker headers and the
    /// delivery-tag marker required by `ack`/`reject`.
    pub async fn get(&self) -> Result<Option<Envelope>, TransportError> {
        let Some(message) = self.connection.get(&self.options.queue).await? else {
            return Ok(None);
        };

        let envelope = self.received_envelope(&message.delivery)?;

        Ok(Some(envelope))
    }

    /// Consumes the queue continuously, handing every decoded envelope to
    /// the handler one at a time.
    ///
    /// The broker stops pushing once `prefetch_count` deliveries are
    /// unacknowledged, so a handler that acks per message provides the
    /// back-pressure. Decode failures are surfaced and end the loop; the
    /// unacknowledged message is redelivered by the broker.
    pub async fn fetch(&self, handler: Arc<dyn EnvelopeHandler>) -> Result<(), TransportError> {
        let mut consumer = self.connection.fetch(&self.options.queue).await?;
        let tracer = global::tracer("amqp consumer");

        while let Some(result) = consumer.next().await {
            let delivery = match result {
                Ok(delivery) => delivery,
                Err(err) => {
                    error!(error = err.to_string(), "errors consume msg");
                    return Err(TransportError::ConsumerError(self.options.queue.clone()));
                }
            };

            let envelope = self.received_envelope(&delivery)?;

            debug!(
                "received: {} - exchange: {}",
                envelope.metadata().event_type(),
                delivery.exchange.to_string(),
            );

            let (_ctx, mut span) = otel::consumer_span(
                &delivery.properties,
                &tracer,
                envelope.metadata().event_type(),
            );

            handler.handle(envelope).await;

            span.end();
        }

        Ok(())
    }

    /// Acknowledges a received envelope, removing it from the queue.
    ///
    /// # Returns
    /// `MissingMarker` without touching the broker when the envelope does
    /// not carry a delivery tag.
    pub async fn ack(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let Some(delivery_tag) = envelope.marker(MARKER_AMQP_DELIVERY_TAG) else {
            return Err(TransportError::MissingMarker(MARKER_AMQP_DELIVERY_TAG));
        };

        self.connection.ack(&self.options.queue, delivery_tag).await
    }

    /// Rejects a received envelope.
    ///
    /// With `requeue = false` the envelope goes straight to the parking
    /// lot. With `requeue = true` it is nacked into the wait-queue retry
    /// loop, unless its `x-death` history already reached the configured
    /// maximum, in which case it is parked as well.
    pub async fn reject(&self, envelope: &Envelope, requeue: bool) -> Result<(), TransportError> {
        let Some(delivery_tag) = envelope.marker(MARKER_AMQP_DELIVERY_TAG) else {
            return Err(TransportError::MissingMarker(MARKER_AMQP_DELIVERY_TAG));
        };

        if !requeue {
            return self.park(envelope, delivery_tag).await;
        }

        if exceeded_retry_count(envelope.headers(), self.options.max_retries) {
            warn!("too many attempts, sending to the parking lot");
            return self.park(envelope, delivery_tag).await;
        }

        warn!("error whiling handling msg, requeuing for later");
        self.connection
            .nack(&self.options.queue, delivery_tag, false)
            .await
    }

    /// Declares topology and bindings for the registered event types,
    /// gated by the receiver option flags.
    pub async fn setup(&self, registered_events: &[String]) -> Result<(), TransportError> {
        self.connection.setup(registered_events, &self.options).await
    }

    /// Returns the receiver options this transport was built with.
    pub fn options(&self) -> &ReceiverOptions {
        &self.options
    }

    fn received_envelope(&self, delivery: &Delivery) -> Result<Envelope, TransportError> {
        let mut envelope = self.encoder.decode(&delivery.properties, &delivery.data)?;

        envelope.set_headers(match delivery.properties.headers() {
            Some(headers) => headers.to_owned(),
            None => FieldTable::default(),
        });
        envelope.add_marker(MARKER_AMQP_DELIVERY_TAG, delivery.delivery_tag);

        Ok(envelope)
    }

    async fn park(&self, envelope: &Envelope, delivery_tag: u64) -> Result<(), TransportError> {
        let dlx_exchange = format!("{}{}", self.options.queue, DLX_SUFFIX);

        let message = self.encoder.encode(envelope)?;

        self.connection
            .publish(&message, &dlx_exchange, PARKING_LOT_ROUTING_KEY)
            .await?;
        self.connection.ack(&self.options.queue, delivery_tag).await
    }
}

/// Injects the current trace context into the outgoing message headers.
fn with_trace_context(message: WireMessage) -> WireMessage {
    let WireMessage { body, properties } = message;

    let mut headers = match properties.headers() {
        Some(headers) => headers.inner().clone(),
        None => BTreeMap::new(),
    };
    otel::inject_current_context(&mut headers);

    WireMessage::new(body, properties.with_headers(FieldTable::from(headers)))
}

/// Reads the broker-maintained `x-death` history and reports whether the
/// entry for the queue the message first died on has reached the maximum.
///
/// A message with no history, or none for its first-death queue, is always
/// retryable.
fn exceeded_retry_count(headers: &FieldTable, max_retries: i64) -> bool {
    let inner = headers.inner();

    let Some(first_death_queue) = inner
        .get(AMQP_HEADERS_FIRST_DEATH_QUEUE)
        .and_then(AMQPValue::as_long_string)
    else {
        return false;
    };

    let Some(deaths) = inner.get(AMQP_HEADERS_X_DEATH).and_then(AMQPValue::as_array) else {
        return false;
    };

    for death in deaths.as_slice() {
        let Some(death) = death.as_field_table() else {
            continue;
        };

        let queue = death.inner().get(AMQP_HEADERS_QUEUE).and_then(AMQPValue::as_long_string);
        if queue.map(|q| q.as_bytes()) == Some(first_death_queue.as_bytes()) {
            let count = death
                .inner()
                .get(AMQP_HEADERS_COUNT)
                .and_then(AMQPValue::as_long_long_int)
                .unwrap_or_default();

            return count >= max_retries;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ConnectionOptions, envelope::Metadata};
    use lapin::types::{FieldArray, LongString, ShortString};

    fn transport() -> Arc<AmqpTransport> {
        AmqpTransport::new(
            AmqpConnection::new(ConnectionOptions::default()),
            Encoder::new(),
            ReceiverOptions::new("my_queue_name"),
        )
        .unwrap()
    }

    fn received_envelope(tag: u64) -> Envelope {
        let mut envelope = Envelope::new(
            Metadata::new("1.0", "a.b.Created", "svc", "e1", "2023-03-22T12:44:07Z"),
            "{}",
        );
        envelope.add_marker(MARKER_AMQP_DELIVERY_TAG, tag);
        envelope
    }

    fn death_headers(queue: &str, count: i64, first_death_queue: &str) -> FieldTable {
        let mut death = BTreeMap::new();
        death.insert(
            ShortString::from(AMQP_HEADERS_QUEUE),
            AMQPValue::LongString(LongString::from(queue)),
        );
        death.insert(
            ShortString::from(AMQP_HEADERS_COUNT),
            AMQPValue::LongLongInt(count),
        );

        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(AMQP_HEADERS_X_DEATH),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(
                FieldTable::from(death),
            )])),
        );
        headers.insert(
            ShortString::from(AMQP_HEADERS_FIRST_DEATH_QUEUE),
            AMQPValue::LongString(LongString::from(first_death_queue)),
        );

        FieldTable::from(headers)
    }

    #[test]
    fn empty_queue_name_is_rejected() {
        let result = AmqpTransport::new(
            AmqpConnection::new(ConnectionOptions::default()),
            Encoder::new(),
            ReceiverOptions::new(""),
        );

        assert!(matches!(result, Err(TransportError::InvalidOptions(_))));
    }

    #[tokio::test]
    async fn ack_requires_the_delivery_tag_marker() {
        let envelope = Envelope::new(
            Metadata::new("1.0", "a.b.Created", "svc", "e1", "2023-03-22T12:44:07Z"),
            "{}",
        );

        let result = transport().ack(&envelope).await;
        assert_eq!(
            result,
            Err(TransportError::MissingMarker(MARKER_AMQP_DELIVERY_TAG))
        );
    }

    #[tokio::test]
    async fn reject_requires_the_delivery_tag_marker() {
        let envelope = Envelope::new(
            Metadata::new("1.0", "a.b.Created", "svc", "e1", "2023-03-22T12:44:07Z"),
            "{}",
        );

        let result = transport().reject(&envelope, true).await;
        assert_eq!(
            result,
            Err(TransportError::MissingMarker(MARKER_AMQP_DELIVERY_TAG))
        );
    }

    #[tokio::test]
    async fn publish_rejects_a_malformed_event_type() {
        let envelope = Envelope::new(
            Metadata::new("1.0", "BookCreated", "svc", "e1", "2023-03-22T12:44:07Z"),
            "{}",
        );

        let result = transport().publish(&envelope).await;
        assert_eq!(
            result,
            Err(TransportError::MalformedEventType("BookCreated".to_owned()))
        );
    }

    #[test]
    fn retry_count_below_the_maximum_is_retryable() {
        let headers = death_headers("my_queue_name", 2, "my_queue_name");
        assert!(!exceeded_retry_count(&headers, 3));
    }

    #[test]
    fn retry_count_at_the_maximum_is_exhausted() {
        let headers = death_headers("my_queue_name", 3, "my_queue_name");
        assert!(exceeded_retry_count(&headers, 3));
    }

    #[test]
    fn no_death_history_is_always_retryable() {
        assert!(!exceeded_retry_count(&FieldTable::default(), 3));
    }

    #[test]
    fn death_history_of_another_queue_is_ignored() {
        let headers = death_headers("some.other.queue", 9, "my_queue_name");
        assert!(!exceeded_retry_count(&headers, 3));
    }

    #[test]
    fn received_envelope_is_stamped_with_marker_and_headers() {
        let envelope = received_envelope(42);
        assert_eq!(envelope.marker(MARKER_AMQP_DELIVERY_TAG), Some(42));
    }
}
