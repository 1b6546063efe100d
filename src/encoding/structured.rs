// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Structured CloudEvents Encoding
//!
//! In structured mode the entire envelope, attributes and payload alike, is
//! one JSON document on the wire. A JSON payload is nested as a JSON value
//! under `data` and re-stringified on decode, so the original body text
//! survives a round trip. Keys outside the known attribute set are captured
//! as extension attributes in encounter order.

use super::{validate_rfc3339, EventPayload, CLOUDEVENTS_CONTENT_TYPE_JSON};
use crate::{
    envelope::{Envelope, Metadata},
    errors::TransportError,
    message::WireMessage,
};
use lapin::{types::ShortString, BasicProperties};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Structured-mode encoder.
#[derive(Debug, Default)]
pub(crate) struct StructuredEncoder;

impl StructuredEncoder {
    pub(crate) fn encode(&self, envelope: &Envelope) -> Result<WireMessage, TransportError> {
        let metadata = envelope.metadata();

        let data = if metadata.data_content_type() == Some(CLOUDEVENTS_CONTENT_TYPE_JSON) {
            serde_json::from_str(envelope.body())
                .map_err(|err| TransportError::EncodingFailed(err.to_string()))?
        } else {
            Value::String(envelope.body().to_owned())
        };

        let mut extensions = Map::new();
        for (name, value) in metadata.extensions() {
            extensions.insert(name.clone(), Value::String(value.clone()));
        }

        let payload = EventPayload {
            source: metadata.source().to_owned(),
            data,
            datacontenttype: metadata.data_content_type().map(str::to_owned),
            time: metadata.time().to_owned(),
            specversion: metadata.spec_version().to_owned(),
            id: metadata.id().to_owned(),
            event_type: metadata.event_type().to_owned(),
            subject: metadata.subject().map(str::to_owned),
            dataschema: metadata.data_schema().map(str::to_owned),
            extensions,
        };

        let body = serde_json::to_vec(&payload)
            .map_err(|err| TransportError::EncodingFailed(err.to_string()))?;

        let mut properties = BasicProperties::default()
            .with_kind(ShortString::from(metadata.event_type()))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()));

        if let Some(content_type) = metadata.data_content_type() {
            properties = properties.with_content_type(ShortString::from(content_type));
        }

        Ok(WireMessage::new(body, properties))
    }

    pub(crate) fn decode(&self, body: &[u8]) -> Result<Envelope, TransportError> {
        let payload: EventPayload = serde_json::from_slice(body)
            .map_err(|err| TransportError::DecodingFailed(err.to_string()))?;

        validate_rfc3339(&payload.time)?;

        let mut metadata = Metadata::new(
            &payload.specversion,
            &payload.event_type,
            &payload.source,
            &payload.id,
            &payload.time,
        );

        if let Some(subject) = &payload.subject {
            metadata = metadata.set_subject(subject);
        }

        if let Some(dataschema) = &payload.dataschema {
            metadata = metadata.set_data_schema(dataschema);
        }

        if let Some(content_type) = &payload.datacontenttype {
            metadata = metadata.set_data_content_type(content_type);
        }

        for (name, value) in &payload.extensions {
            let value = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            metadata = metadata.add_extension(name, &value);
        }

        let body = if payload.datacontenttype.as_deref() == Some(CLOUDEVENTS_CONTENT_TYPE_JSON) {
            serde_json::to_string(&payload.data)
                .map_err(|err| TransportError::DecodingFailed(err.to_string()))?
        } else {
            match payload.data {
                Value::String(text) => text,
                other => serde_json::to_string(&other)
                    .map_err(|err| TransportError::DecodingFailed(err.to_string()))?,
            }
        };

        Ok(Envelope::new(metadata, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_produces_one_json_document() {
        let envelope = Envelope::new(
            Metadata::new(
                "1.0",
                "example.books.v1.BookCreated",
                "protoevent-rs",
                "859a8ad5-ad3f-475e-b2c2-38e568830631",
                "2023-03-22T12:44:07+00:00",
            )
            .set_data_content_type(CLOUDEVENTS_CONTENT_TYPE_JSON),
            r#"{"id":123}"#,
        );

        let message = StructuredEncoder.encode(&envelope).unwrap();

        assert_eq!(
            std::str::from_utf8(message.body()).unwrap(),
            r#"{"source":"protoevent-rs","data":{"id":123},"datacontenttype":"application/cloudevents+json","time":"2023-03-22T12:44:07+00:00","specversion":"1.0","id":"859a8ad5-ad3f-475e-b2c2-38e568830631","type":"example.books.v1.BookCreated"}"#
        );
    }

    #[test]
    fn decode_captures_unknown_keys_as_extensions() {
        let body = r#"{"source":"protoevent-rs","data":{"id":123},"datacontenttype":"application/cloudevents+json","time":"2023-03-22T12:44:07+00:00","specversion":"1.0","id":"859a8ad5-ad3f-475e-b2c2-38e568830631","type":"example.books.v1.BookCreated","someextension":"extension_value"}"#;

        let decoded = StructuredEncoder.decode(body.as_bytes()).unwrap();

        let expected = Envelope::new(
            Metadata::new(
                "1.0",
                "example.books.v1.BookCreated",
                "protoevent-rs",
                "859a8ad5-ad3f-475e-b2c2-38e568830631",
                "2023-03-22T12:44:07+00:00",
            )
            .set_data_content_type(CLOUDEVENTS_CONTENT_TYPE_JSON)
            .add_extension("someextension", "extension_value"),
            r#"{"id":123}"#,
        );

        assert_eq!(decoded, expected);
    }

    #[test]
    fn round_trip_preserves_extension_order() {
        let envelope = Envelope::new(
            Metadata::new(
                "1.0",
                "example.books.v1.BookCreated",
                "svc",
                "e1",
                "2023-03-22T12:44:07Z",
            )
            .set_data_content_type(CLOUDEVENTS_CONTENT_TYPE_JSON)
            .set_subject("books/123")
            .add_extension("zeta", "last-first")
            .add_extension("alpha", "first-last"),
            r#"{"id":123,"title":"Dune"}"#,
        );

        let message = StructuredEncoder.encode(&envelope).unwrap();
        let decoded = StructuredEncoder.decode(message.body()).unwrap();

        assert_eq!(decoded, envelope);
    }

    #[test]
    fn decode_fails_on_non_object_payload() {
        let result = StructuredEncoder.decode(br#"["not","an","object"]"#);
        assert!(matches!(result, Err(TransportError::DecodingFailed(_))));
    }

    #[test]
    fn decode_fails_on_missing_required_attribute() {
        // no `source`
        let body = r#"{"data":{},"time":"2023-03-22T12:44:07Z","specversion":"1.0","id":"e1","type":"a.b.Created"}"#;

        let result = StructuredEncoder.decode(body.as_bytes());
        assert!(matches!(result, Err(TransportError::DecodingFailed(_))));
    }

    #[test]
    fn decode_fails_on_invalid_time() {
        let body = r#"{"source":"svc","data":{},"time":"not-a-time","specversion":"1.0","id":"e1","type":"a.b.Created"}"#;

        let result = StructuredEncoder.decode(body.as_bytes());
        assert!(matches!(result, Err(TransportError::DecodingFailed(_))));
    }

    #[test]
    fn encode_fails_on_non_json_body_in_json_mode() {
        let envelope = Envelope::new(
            Metadata::new("1.0", "a.b.Created", "svc", "e1", "2023-03-22T12:44:07Z")
                .set_data_content_type(CLOUDEVENTS_CONTENT_TYPE_JSON),
            "definitely not json",
        );

        let result = StructuredEncoder.encode(&envelope);
        assert!(matches!(result, Err(TransportError::EncodingFailed(_))));
    }
}
