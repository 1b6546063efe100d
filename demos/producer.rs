// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Publishes one structured `BookCreated` event and exits.

use eventbus_amqp::{
    config::{ConnectionOptions, ReceiverOptions},
    connection::AmqpConnection,
    encoding::{Encoder, CLOUDEVENTS_CONTENT_TYPE_JSON},
    envelope::{Envelope, Metadata},
    transport::AmqpTransport,
};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let connection = AmqpConnection::new(ConnectionOptions::new().name("books-producer"));

    let transport = AmqpTransport::new(
        connection,
        Encoder::new(),
        ReceiverOptions::new("example.consumers.v1")
            .setup_topology()
            .setup_bindings(),
    )?;

    transport
        .setup(&["example.books.v1.BookCreated".to_owned()])
        .await?;

    let metadata = Metadata::new(
        "1.0",
        "example.books.v1.BookCreated",
        "books-producer",
        &Uuid::new_v4().to_string(),
        &chrono::Utc::now().to_rfc3339(),
    )
    .set_data_content_type(CLOUDEVENTS_CONTENT_TYPE_JSON);

    let envelope = Envelope::new(metadata, r#"{"id":312}"#);

    transport.publish(&envelope).await?;
    println!("published {}", envelope.metadata().id());

    Ok(())
}
