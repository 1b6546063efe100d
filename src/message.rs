// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Wire Message
//!
//! The encoded form of an envelope: the serialized body plus the AMQP
//! properties (content type, type, message id, headers) that accompany it on
//! the wire. Produced by the codec, consumed by the connection when
//! publishing.

use lapin::BasicProperties;

/// An encoded message ready to be handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub(crate) body: Vec<u8>,
    pub(crate) properties: BasicProperties,
}

impl WireMessage {
    /// Creates a wire message from a serialized body and its properties.
    pub fn new(body: Vec<u8>, properties: BasicProperties) -> WireMessage {
        WireMessage { body, properties }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn properties(&self) -> &BasicProperties {
        &self.properties
    }
}
