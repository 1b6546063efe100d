// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Envelope and Metadata
//!
//! This module provides the in-memory message model of the event bus: the
//! CloudEvents-style attribute set (`Metadata`) and the transport unit that
//! carries it together with the payload (`Envelope`). Both are pure data
//! holders with no I/O; the codec and the transport operate on them.

use crate::errors::TransportError;
use lapin::types::FieldTable;
use std::collections::HashMap;

/// Splits a dotted event type at its last `.` into the exchange name and
/// the routing key: `a.b.c.Created` becomes (`a.b.c`, `Created`).
pub fn split_event_type(event_type: &str) -> Result<(&str, &str), TransportError> {
    match event_type.rsplit_once('.') {
        Some((exchange, routing_key)) if !exchange.is_empty() && !routing_key.is_empty() => {
            Ok((exchange, routing_key))
        }
        _ => Err(TransportError::MalformedEventType(event_type.to_owned())),
    }
}

/// CloudEvents-style context attributes of one event.
///
/// The first five attributes are required; `subject`, `data_schema` and
/// `data_content_type` are optional. The event type follows the dotted
/// `<exchange>.<routingKey>` convention, e.g. `example.books.v1.BookCreated`,
/// and must contain at least one `.`. Extension attributes keep their
/// encounter order, which also makes equality order-sensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub(crate) spec_version: String,
    pub(crate) event_type: String,
    pub(crate) source: String,
    pub(crate) id: String,
    pub(crate) time: String,
    pub(crate) subject: Option<String>,
    pub(crate) data_schema: Option<String>,
    pub(crate) data_content_type: Option<String>,
    pub(crate) extensions: Vec<(String, String)>,
}

impl Metadata {
    /// Creates metadata from the five required attributes.
    ///
    /// # Parameters
    /// * `spec_version` - CloudEvents spec version, e.g. `1.0`
    /// * `event_type` - dotted event type, `<exchange>.<routingKey>`
    /// * `source` - producer identity
    /// * `id` - unique event id
    /// * `time` - RFC 3339 timestamp
    pub fn new(
        spec_version: &str,
        event_type: &str,
        source: &str,
        id: &str,
        time: &str,
    ) -> Metadata {
        Metadata {
            spec_version: spec_version.to_owned(),
            event_type: event_type.to_owned(),
            source: source.to_owned(),
            id: id.to_owned(),
            time: time.to_owned(),
            subject: None,
            data_schema: None,
            data_content_type: None,
            extensions: vec![],
        }
    }

    /// Sets the subject attribute.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn set_subject(mut self, subject: &str) -> Self {
        self.subject = Some(subject.to_owned());
        self
    }

    /// Sets the data schema attribute.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn set_data_schema(mut self, data_schema: &str) -> Self {
        self.data_schema = Some(data_schema.to_owned());
        self
    }

    /// Sets the MIME type of the payload. `application/cloudevents+json`
    /// switches the codec to structured encoding.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn set_data_content_type(mut self, content_type: &str) -> Self {
        self.data_content_type = Some(content_type.to_owned());
        self
    }

    /// Appends an extension attribute, preserving encounter order.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn add_extension(mut self, name: &str, value: &str) -> Self {
        self.extensions.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn spec_version(&self) -> &str {
        &self.spec_version
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn time(&self) -> &str {
        &self.time
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn data_schema(&self) -> Option<&str> {
        self.data_schema.as_deref()
    }

    pub fn data_content_type(&self) -> Option<&str> {
        self.data_content_type.as_deref()
    }

    /// Returns the extension attributes in encounter order.
    pub fn extensions(&self) -> &[(String, String)] {
        &self.extensions
    }
}

/// One unit of transport: metadata, an opaque payload, the raw broker
/// headers of the delivery and the transport-private markers.
///
/// Envelopes are created either by a producer before publishing or by the
/// codec on the receive path. Raw headers and the delivery-tag marker are
/// stamped by the receiving transport right after decode; they never travel
/// on the wire. The marker is what makes `ack`/`reject` possible, so calling
/// either on an envelope without it is caller misuse, not a broker failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    metadata: Metadata,
    body: String,
    headers: FieldTable,
    markers: HashMap<String, u64>,
}

impl Envelope {
    /// Creates an envelope ready to be published.
    pub fn new(metadata: Metadata, body: &str) -> Envelope {
        Envelope {
            metadata,
            body: body.to_owned(),
            headers: FieldTable::default(),
            markers: HashMap::default(),
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Returns the raw protocol headers as received from the broker.
    pub fn headers(&self) -> &FieldTable {
        &self.headers
    }

    /// Replaces the raw protocol headers. Called by the transport on the
    /// receive path before the envelope is handed out.
    pub fn set_headers(&mut self, headers: FieldTable) {
        self.headers = headers;
    }

    /// Attaches a transport-private marker to the envelope.
    pub fn add_marker(&mut self, name: &str, value: u64) {
        self.markers.insert(name.to_owned(), value);
    }

    /// Returns the marker with the given name, if the envelope carries one.
    pub fn marker(&self, name: &str) -> Option<u64> {
        self.markers.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_fluent_construction() {
        let metadata = Metadata::new(
            "1.0",
            "example.books.v1.BookCreated",
            "svc",
            "e1",
            "2023-03-22T12:44:07+00:00",
        )
        .set_subject("books/123")
        .set_data_schema("https://example.com/book.json")
        .set_data_content_type("application/json")
        .add_extension("tenant", "acme")
        .add_extension("region", "eu");

        assert_eq!(metadata.event_type(), "example.books.v1.BookCreated");
        assert_eq!(metadata.subject(), Some("books/123"));
        assert_eq!(
            metadata.extensions(),
            &[
                ("tenant".to_owned(), "acme".to_owned()),
                ("region".to_owned(), "eu".to_owned())
            ]
        );
    }

    #[test]
    fn metadata_equality_is_structural() {
        let build = || {
            Metadata::new("1.0", "a.b.Created", "svc", "e1", "2023-03-22T12:44:07Z")
                .add_extension("one", "1")
                .add_extension("two", "2")
        };

        assert_eq!(build(), build());

        let reordered = Metadata::new("1.0", "a.b.Created", "svc", "e1", "2023-03-22T12:44:07Z")
            .add_extension("two", "2")
            .add_extension("one", "1");
        assert_ne!(build(), reordered);
    }

    #[test]
    fn event_type_splits_at_the_last_dot() {
        assert_eq!(
            split_event_type("a.b.c.Created").unwrap(),
            ("a.b.c", "Created")
        );
        assert_eq!(
            split_event_type("example.books.v1.BookCreated").unwrap(),
            ("example.books.v1", "BookCreated")
        );
    }

    #[test]
    fn event_type_without_dot_is_malformed() {
        assert_eq!(
            split_event_type("BookCreated"),
            Err(TransportError::MalformedEventType("BookCreated".to_owned()))
        );
        assert_eq!(
            split_event_type(".Created"),
            Err(TransportError::MalformedEventType(".Created".to_owned()))
        );
        assert_eq!(
            split_event_type("books."),
            Err(TransportError::MalformedEventType("books.".to_owned()))
        );
    }

    #[test]
    fn envelope_markers() {
        let mut envelope = Envelope::new(
            Metadata::new("1.0", "a.b.Created", "svc", "e1", "2023-03-22T12:44:07Z"),
            "{}",
        );

        assert_eq!(envelope.marker("amqp_delivery_tag"), None);

        envelope.add_marker("amqp_delivery_tag", 42);
        assert_eq!(envelope.marker("amqp_delivery_tag"), Some(42));
    }
}
