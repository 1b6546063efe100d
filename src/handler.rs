// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Envelope Handler Seam
//!
//! The interface the external dispatch layer implements to receive
//! envelopes from a blocking `fetch` loop.

use crate::envelope::Envelope;
use async_trait::async_trait;

/// Processes one received envelope at a time.
///
/// The transport invokes `handle` synchronously for every delivery; the next
/// message is not processed until the call returns. The implementation is
/// responsible for calling `ack` or `reject` on the transport exactly once
/// per envelope, based on the outcome of its own processing.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope);
}
