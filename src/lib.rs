// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod config;
pub mod connection;
pub mod encoding;
pub mod envelope;
pub mod errors;
pub mod handler;
pub mod message;
pub mod transport;
