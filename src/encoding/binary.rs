// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Binary CloudEvents Encoding
//!
//! In binary mode the event attributes travel as message headers under the
//! `cloudEvents:` key namespace and the type property of the message carries
//! the event type, while the body is the full JSON event document. Decoding
//! reads the attributes back from the headers and treats them as
//! authoritative; the body is only consulted for the payload.

use super::{validate_rfc3339, EventPayload};
use crate::{
    envelope::{Envelope, Metadata},
    errors::TransportError,
    message::WireMessage,
};
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

const SPECVERSION: &str = "cloudEvents:specversion";
const ID: &str = "cloudEvents:id";
const SOURCE: &str = "cloudEvents:source";
const SUBJECT: &str = "cloudEvents:subject";
const DATASCHEMA: &str = "cloudEvents:dataschema";
const TIME: &str = "cloudEvents:time";

/// Binary-mode encoder.
#[derive(Debug, Default)]
pub(crate) struct BinaryEncoder;

impl BinaryEncoder {
    pub(crate) fn encode(&self, envelope: &Envelope) -> Result<WireMessage, TransportError> {
        let metadata = envelope.metadata();

        let mut headers = BTreeMap::<ShortString, AMQPValue>::new();
        headers.insert(
            ShortString::from(SPECVERSION),
            AMQPValue::LongString(LongString::from(metadata.spec_version())),
        );
        headers.insert(
            ShortString::from(ID),
            AMQPValue::LongString(LongString::from(metadata.id())),
        );
        headers.insert(
            ShortString::from(SOURCE),
            AMQPValue::LongString(LongString::from(metadata.source())),
        );

        if let Some(subject) = metadata.subject() {
            headers.insert(
                ShortString::from(SUBJECT),
                AMQPValue::LongString(LongString::from(subject)),
            );
        }

        if let Some(data_schema) = metadata.data_schema() {
            headers.insert(
                ShortString::from(DATASCHEMA),
                AMQPValue::LongString(LongString::from(data_schema)),
            );
        }

        headers.insert(
            ShortString::from(TIME),
            AMQPValue::LongString(LongString::from(metadata.time())),
        );

        let payload = EventPayload {
            source: metadata.source().to_owned(),
            data: Value::String(envelope.body().to_owned()),
            datacontenttype: metadata.data_content_type().map(str::to_owned),
            time: metadata.time().to_owned(),
            specversion: metadata.spec_version().to_owned(),
            id: metadata.id().to_owned(),
            event_type: metadata.event_type().to_owned(),
            subject: None,
            dataschema: None,
            extensions: Map::new(),
        };

        let body = serde_json::to_vec(&payload)
            .map_err(|err| TransportError::EncodingFailed(err.to_string()))?;

        let mut properties = BasicProperties::default()
            .with_kind(ShortString::from(metadata.event_type()))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));

        if let Some(content_type) = metadata.data_content_type() {
            properties = properties.with_content_type(ShortString::from(content_type));
        }

        Ok(WireMessage::new(body, properties))
    }

    pub(crate) fn decode(
        &self,
        properties: &BasicProperties,
        body: &[u8],
    ) -> Result<Envelope, TransportError> {
        let event_type = match properties.kind() {
            Some(kind) if !kind.as_str().is_empty() => kind.as_str().to_owned(),
            _ => {
                return Err(TransportError::DecodingFailed(
                    "missing event type property".to_owned(),
                ))
            }
        };

        let headers = match properties.headers() {
            Some(headers) => headers.to_owned(),
            None => FieldTable::default(),
        };
        let headers = headers.inner();

        let spec_version = required_header(headers, SPECVERSION)?;
        let id = required_header(headers, ID)?;
        let source = required_header(headers, SOURCE)?;
        let subject = required_header(headers, SUBJECT)?;
        let data_schema = required_header(headers, DATASCHEMA)?;
        let time = required_header(headers, TIME)?;
        validate_rfc3339(&time)?;

        let payload: EventPayload = serde_json::from_slice(body)
            .map_err(|err| TransportError::DecodingFailed(err.to_string()))?;

        let body = match payload.data {
            Value::String(text) => text,
            other => serde_json::to_string(&other)
                .map_err(|err| TransportError::DecodingFailed(err.to_string()))?,
        };

        let mut metadata = Metadata::new(&spec_version, &event_type, &source, &id, &time)
            .set_subject(&subject)
            .set_data_schema(&data_schema);

        if let Some(content_type) = properties.content_type() {
            metadata = metadata.set_data_content_type(content_type.as_str());
        }

        Ok(Envelope::new(metadata, &body))
    }
}

fn required_header(
    headers: &BTreeMap<ShortString, AMQPValue>,
    name: &str,
) -> Result<String, TransportError> {
    match headers.get(name).and_then(AMQPValue::as_long_string) {
        Some(value) => Ok(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        None => Err(TransportError::DecodingFailed(format!(
            "missing required header `{name}`"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> Envelope {
        Envelope::new(
            Metadata::new(
                "1.0",
                "example.books.v1.BookCreated",
                "protoevent-rs",
                "859a8ad5-ad3f-475e-b2c2-38e568830631",
                "2023-03-22T12:44:07+00:00",
            )
            .set_subject("books/123")
            .set_data_schema("https://example.com/book.json")
            .set_data_content_type("application/json"),
            r#"{"id":123}"#,
        )
    }

    #[test]
    fn encode_carries_attributes_as_headers() {
        let message = BinaryEncoder.encode(&sample_envelope()).unwrap();

        let headers = message.properties().headers().clone().unwrap();
        let inner = headers.inner();

        assert_eq!(
            inner.get(SPECVERSION),
            Some(&AMQPValue::LongString(LongString::from("1.0")))
        );
        assert_eq!(
            inner.get(ID),
            Some(&AMQPValue::LongString(LongString::from(
                "859a8ad5-ad3f-475e-b2c2-38e568830631"
            )))
        );
        assert_eq!(
            inner.get(SOURCE),
            Some(&AMQPValue::LongString(LongString::from("protoevent-rs")))
        );
        assert_eq!(
            message.properties().kind(),
            &Some(ShortString::from("example.books.v1.BookCreated"))
        );
    }

    #[test]
    fn round_trip_preserves_metadata_and_body() {
        let envelope = sample_envelope();

        let message = BinaryEncoder.encode(&envelope).unwrap();
        let decoded = BinaryEncoder.decode(message.properties(), message.body()).unwrap();

        assert_eq!(decoded.metadata(), envelope.metadata());
        assert_eq!(decoded.body(), envelope.body());
    }

    #[test]
    fn decode_fails_without_event_type() {
        let message = BinaryEncoder.encode(&sample_envelope()).unwrap();

        let properties = message.properties().clone().with_kind(ShortString::from(""));
        let result = BinaryEncoder.decode(&properties, message.body());

        assert!(matches!(result, Err(TransportError::DecodingFailed(_))));
    }

    #[test]
    fn decode_fails_on_missing_required_header() {
        let message = BinaryEncoder.encode(&sample_envelope()).unwrap();

        let mut headers = message.properties().headers().clone().unwrap().inner().clone();
        headers.remove(SOURCE);
        let properties = message
            .properties()
            .clone()
            .with_headers(FieldTable::from(headers));

        let result = BinaryEncoder.decode(&properties, message.body());
        assert_eq!(
            result,
            Err(TransportError::DecodingFailed(
                "missing required header `cloudEvents:source`".to_owned()
            ))
        );
    }

    #[test]
    fn decode_fails_on_invalid_time() {
        let message = BinaryEncoder.encode(&sample_envelope()).unwrap();

        let mut headers = message.properties().headers().clone().unwrap().inner().clone();
        headers.insert(
            ShortString::from(TIME),
            AMQPValue::LongString(LongString::from("yesterday at noon")),
        );
        let properties = message
            .properties()
            .clone()
            .with_headers(FieldTable::from(headers));

        let result = BinaryEncoder.decode(&properties, message.body());
        assert!(matches!(result, Err(TransportError::DecodingFailed(_))));
    }
}
