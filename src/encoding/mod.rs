// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Envelope Codec
//!
//! This module converts envelopes to and from their wire representation.
//! Two CloudEvents wire modes exist: binary (attributes as message headers)
//! and structured (the whole envelope as one JSON document). Which one is
//! used is a pure function of the data content type, so a message encoded as
//! structured by any producer is recognized as structured by any consumer.

mod binary;
mod structured;

use crate::{envelope::Envelope, errors::TransportError, message::WireMessage};
use binary::BinaryEncoder;
use lapin::BasicProperties;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use structured::StructuredEncoder;

/// Content type that selects the structured CloudEvents wire mode
pub const CLOUDEVENTS_CONTENT_TYPE_JSON: &str = "application/cloudevents+json";

/// The two CloudEvents wire modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingKind {
    Binary,
    Structured,
}

impl EncodingKind {
    /// Selects the wire mode for a content type. Only
    /// `application/cloudevents+json` maps to structured; everything else,
    /// including an absent content type, is binary.
    pub fn of(content_type: Option<&str>) -> EncodingKind {
        match content_type {
            Some(CLOUDEVENTS_CONTENT_TYPE_JSON) => EncodingKind::Structured,
            _ => EncodingKind::Binary,
        }
    }
}

/// The JSON document both wire modes carry as the message body.
///
/// Field order is the serialization order. Extension attributes are
/// flattened to top-level keys; any key outside the known set lands in
/// `extensions` on deserialize, in encounter order.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct EventPayload {
    pub(crate) source: String,
    pub(crate) data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) datacontenttype: Option<String>,
    pub(crate) time: String,
    pub(crate) specversion: String,
    pub(crate) id: String,
    #[serde(rename = "type")]
    pub(crate) event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) dataschema: Option<String>,
    #[serde(flatten)]
    pub(crate) extensions: Map<String, Value>,
}

/// Rejects timestamps that are not valid RFC 3339.
pub(crate) fn validate_rfc3339(time: &str) -> Result<(), TransportError> {
    match chrono::DateTime::parse_from_rfc3339(time) {
        Ok(_) => Ok(()),
        Err(err) => Err(TransportError::DecodingFailed(format!(
            "invalid rfc3339 time `{time}`: {err}"
        ))),
    }
}

/// Dispatching encoder over the binary and structured wire modes.
///
/// Encode dispatches on the envelope's data content type, decode on the
/// incoming message's content type property; the selection is symmetric.
#[derive(Debug, Default)]
pub struct Encoder {
    binary: BinaryEncoder,
    structured: StructuredEncoder,
}

impl Encoder {
    /// Creates an encoder handling both wire modes.
    pub fn new() -> Encoder {
        Encoder {
            binary: BinaryEncoder,
            structured: StructuredEncoder,
        }
    }

    /// Encodes an envelope into a wire message.
    ///
    /// # Returns
    /// The encoded message, or `EncodingFailed` when the body cannot be
    /// serialized for the selected mode.
    pub fn encode(&self, envelope: &Envelope) -> Result<WireMessage, TransportError> {
        match EncodingKind::of(envelope.metadata().data_content_type()) {
            EncodingKind::Structured => self.structured.encode(envelope),
            EncodingKind::Binary => self.binary.encode(envelope),
        }
    }

    /// Decodes a received message into an envelope.
    ///
    /// Decoding is atomic: on any missing or malformed required attribute
    /// the call fails with `DecodingFailed` and no envelope is produced.
    pub fn decode(
        &self,
        properties: &BasicProperties,
        body: &[u8],
    ) -> Result<Envelope, TransportError> {
        let content_type = properties.content_type().as_ref().map(|ct| ct.as_str());

        match EncodingKind::of(content_type) {
            EncodingKind::Structured => self.structured.decode(body),
            EncodingKind::Binary => self.binary.decode(properties, body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Metadata;
    use lapin::types::ShortString;

    #[test]
    fn encoding_kind_selection() {
        assert_eq!(
            EncodingKind::of(Some("application/cloudevents+json")),
            EncodingKind::Structured
        );
        assert_eq!(EncodingKind::of(Some("application/json")), EncodingKind::Binary);
        assert_eq!(EncodingKind::of(Some("text/plain")), EncodingKind::Binary);
        assert_eq!(EncodingKind::of(None), EncodingKind::Binary);
    }

    #[test]
    fn dispatch_is_symmetric() {
        let encoder = Encoder::new();

        let envelope = Envelope::new(
            Metadata::new(
                "1.0",
                "example.books.v1.BookCreated",
                "svc",
                "e1",
                "2023-03-22T12:44:07+00:00",
            )
            .set_data_content_type(CLOUDEVENTS_CONTENT_TYPE_JSON),
            r#"{"id":123}"#,
        );

        let message = encoder.encode(&envelope).unwrap();
        assert_eq!(
            message.properties().content_type(),
            &Some(ShortString::from(CLOUDEVENTS_CONTENT_TYPE_JSON))
        );

        let decoded = encoder.decode(message.properties(), message.body()).unwrap();
        assert_eq!(decoded.metadata(), envelope.metadata());
        assert_eq!(decoded.body(), envelope.body());
    }
}
