// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Reliable RabbitMQ consumers and publishers.
//!
//! A [`agent::ConsumerAgent`] connects to a [`broker::Broker`], declares the
//! exchanges, queues and bindings its consumer needs, and feeds every delivery to
//! a [`consumer::Consumer`], reconnecting whenever the connection is lost. The
//! [`publisher::Publisher`] publishes on a cached confirm-mode channel.

mod otel;

pub mod agent;
pub mod broker;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod properties;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod topology;

#[cfg(test)]
mod testing;
