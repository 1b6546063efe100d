// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Consumes `BookCreated` events from the reliable queue, acking on
//! success and escalating failures through the retry loop.

use async_trait::async_trait;
use eventbus_amqp::{
    config::{ConnectionOptions, ReceiverOptions},
    connection::AmqpConnection,
    encoding::Encoder,
    envelope::Envelope,
    handler::EnvelopeHandler,
    transport::AmqpTransport,
};
use std::sync::Arc;

struct BookCreatedHandler {
    transport: Arc<AmqpTransport>,
}

#[async_trait]
impl EnvelopeHandler for BookCreatedHandler {
    async fn handle(&self, envelope: Envelope) {
        match serde_json::from_str::<serde_json::Value>(envelope.body()) {
            Ok(book) => {
                println!("book created: {book}");
                if let Err(err) = self.transport.ack(&envelope).await {
                    eprintln!("ack failed: {err}");
                }
            }
            Err(err) => {
                eprintln!("unreadable book payload, retrying later: {err}");
                if let Err(err) = self.transport.reject(&envelope, true).await {
                    eprintln!("reject failed: {err}");
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let connection = AmqpConnection::new(ConnectionOptions::new().name("books-consumer"));

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

    let handler = Arc::new(BookCreatedHandler {
        transport: transport.clone(),
    });

    println!("waiting for events, ctrl-c to quit...");
    transport.fetch(handler).await?;

    Ok(())
}
