// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Declare Options and Bindings
//!
//! This module provides the options used when the agent declares a queue, and the
//! [`Binding`] descriptor that links a queue to an exchange through a routing key.
//! Broker-side features such as message TTL, length limits and dead-letter routing
//! are expressed as declare arguments.

use crate::topology::field_table;
use lapin::{options::QueueDeclareOptions, types::FieldTable};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Options applied when declaring one named queue.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    #[serde(alias = "delete")]
    pub auto_delete: bool,
    pub passive: bool,
    pub nowait: bool,
    pub arguments: BTreeMap<String, Value>,
}

impl QueueOptions {
    /// Creates options for a non-durable, non-exclusive queue.
    pub fn new() -> QueueOptions {
        QueueOptions::default()
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(self, ttl: i64) -> Self {
        self.argument(AMQP_HEADERS_MESSAGE_TTL, Value::from(ttl))
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(self, max: i64) -> Self {
        self.argument(AMQP_HEADERS_MAX_LENGTH, Value::from(max))
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(self, max_bytes: i64) -> Self {
        self.argument(AMQP_HEADERS_MAX_LENGTH_BYTES, Value::from(max_bytes))
    }

    /// Routes rejected and expired messages to `exchange`, optionally with a
    /// replacement routing key.
    pub fn dead_letter(self, exchange: &str, routing_key: Option<&str>) -> Self {
        let opts = self.argument(AMQP_HEADERS_DEAD_LETTER_EXCHANGE, Value::from(exchange));

        match routing_key {
            Some(key) => opts.argument(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, Value::from(key)),
            None => opts,
        }
    }

    /// Adds a single declare argument.
    pub fn argument(mut self, key: &str, value: Value) -> Self {
        self.arguments.insert(key.to_owned(), value);
        self
    }

    pub(crate) fn declare_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            nowait: self.nowait,
        }
    }

    pub(crate) fn arguments_table(&self) -> FieldTable {
        field_table(&self.arguments)
    }
}

/// Binds a queue to an exchange with a routing key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    #[serde(default)]
    pub routing_key: String,
}

impl Binding {
    /// Creates a binding for the given queue.
    ///
    /// The exchange name and routing key start empty and are set with the
    /// `exchange` and `routing_key` methods.
    pub fn new(queue: &str) -> Binding {
        Binding {
            queue: queue.to_owned(),
            exchange: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}
