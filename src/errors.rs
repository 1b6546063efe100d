// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Event-Bus Transport
//!
//! This module provides the error set for every transport operation.
//! The `TransportError` enum covers connection establishment, topology
//! declaration, publishing, consuming, acknowledgement and the envelope
//! codec, plus the invariant violations that indicate caller misuse.

use thiserror::Error;

/// Represents errors that can occur while moving events over AMQP.
///
/// Codec failures (`EncodingFailed`/`DecodingFailed`) are never retried by
/// the transport itself; broker failures are surfaced without internal
/// reconnection; `MissingMarker` and `MalformedEventType` signal programmer
/// errors and are not recoverable in-process.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransportError {
    /// A connection to the broker could not be established
    #[error("failure to connect to the broker")]
    BrokerUnavailable,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare the exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare the queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind the queue `{0}` to the exchange `{1}`")]
    BindQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error publishing a message to an exchange
    #[error("failure to publish to the exchange `{0}`")]
    PublishingError(String),

    /// Error starting or driving a consumer on a queue
    #[error("failure to consume from the queue `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// An envelope could not be turned into a wire message
    #[error("failure to encode envelope: {0}")]
    EncodingFailed(String),

    /// A wire message could not be turned back into an envelope
    #[error("failure to decode message: {0}")]
    DecodingFailed(String),

    /// Ack/reject was called on an envelope that was never received
    #[error("envelope is missing the `{0}` marker")]
    MissingMarker(&'static str),

    /// The event type does not follow the `<exchange>.<routingKey>` form
    #[error("malformed event type `{0}`")]
    MalformedEventType(String),

    /// The receiver options do not describe a usable consumer
    #[error("invalid receiver options: {0}")]
    InvalidOptions(String),
}
