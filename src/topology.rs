// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Declaration
//!
//! This module provides the per-binding declaration chain used by the consumer agent.
//! Every [`Binding`] is set up in four strictly ordered steps, each waiting for the
//! broker's confirmation before the next one starts:
//!
//! 1. declare the exchange, with the options configured for its name
//! 2. declare the queue, with the options configured for its name
//! 3. bind the queue to the exchange with the routing key
//! 4. ensure a consumer is running on the queue
//!
//! Steps of different bindings are independent and may interleave freely.

use crate::{
    channel::Channel,
    errors::AmqpError,
    exchange::ExchangeOptions,
    queue::{Binding, QueueOptions},
};
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use serde::Deserialize;
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};
use tracing::{debug, info};

/// Declare options keyed by exchange and queue name.
///
/// Names without an entry are declared with default options.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub exchanges: HashMap<String, ExchangeOptions>,
    pub queues: HashMap<String, QueueOptions>,
}

impl TopologyConfig {
    pub fn new() -> TopologyConfig {
        TopologyConfig::default()
    }

    /// Registers the options used to declare the named exchange.
    pub fn exchange(mut self, name: &str, options: ExchangeOptions) -> Self {
        self.exchanges.insert(name.to_owned(), options);
        self
    }

    /// Registers the options used to declare the named queue.
    pub fn queue(mut self, name: &str, options: QueueOptions) -> Self {
        self.queues.insert(name.to_owned(), options);
        self
    }

    pub fn exchange_options(&self, name: &str) -> ExchangeOptions {
        self.exchanges.get(name).cloned().unwrap_or_default()
    }

    pub fn queue_options(&self, name: &str) -> QueueOptions {
        self.queues.get(name).cloned().unwrap_or_default()
    }
}

/// One step of a binding's declaration chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingStep {
    ExchangeDeclaring,
    QueueDeclaring,
    Binding,
    EnsuringConsume,
}

impl BindingStep {
    /// The step that follows a confirmed `self`, `None` after the last one.
    pub fn next(self) -> Option<BindingStep> {
        match self {
            BindingStep::ExchangeDeclaring => Some(BindingStep::QueueDeclaring),
            BindingStep::QueueDeclaring => Some(BindingStep::Binding),
            BindingStep::Binding => Some(BindingStep::EnsuringConsume),
            BindingStep::EnsuringConsume => None,
        }
    }
}

impl fmt::Display for BindingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BindingStep::ExchangeDeclaring => "exchange-declaring",
            BindingStep::QueueDeclaring => "queue-declaring",
            BindingStep::Binding => "binding",
            BindingStep::EnsuringConsume => "ensuring-consume",
        };
        f.write_str(name)
    }
}

/// Issues the broker RPC for one declaration step and waits for its confirmation.
///
/// `EnsuringConsume` is not a broker RPC; the agent handles it itself.
pub async fn run_step(
    channel: &dyn Channel,
    topology: &TopologyConfig,
    binding: &Binding,
    step: BindingStep,
) -> Result<(), AmqpError> {
    match step {
        BindingStep::ExchangeDeclaring => {
            info!(exchange = %binding.exchange, "declaring exchange");
            let options = topology.exchange_options(&binding.exchange);
            channel.exchange_declare(&binding.exchange, &options).await
        }
        BindingStep::QueueDeclaring => {
            let options = topology.queue_options(&binding.queue);
            info!(queue = %binding.queue, "declaring queue");
            debug!(queue = %binding.queue, options = ?options, "queue declare options");
            channel.queue_declare(&binding.queue, &options).await
        }
        BindingStep::Binding => {
            info!(
                queue = %binding.queue,
                exchange = %binding.exchange,
                routing_key = %binding.routing_key,
                "binding queue to exchange"
            );
            channel
                .queue_bind(&binding.queue, &binding.exchange, &binding.routing_key)
                .await
        }
        BindingStep::EnsuringConsume => Ok(()),
    }
}

/// Converts free-form declare arguments into an AMQP field table.
pub(crate) fn field_table(args: &BTreeMap<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in args {
        table.insert(ShortString::from(key.as_str()), amqp_value(value));
    }
    table
}

fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(v) => AMQPValue::Boolean(*v),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => AMQPValue::LongLongInt(i),
            (None, Some(f)) => AMQPValue::Double(f),
            (None, None) => AMQPValue::LongString(LongString::from(n.to_string())),
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s.as_str())),
        Value::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(amqp_value).collect::<Vec<_>>()))
        }
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, value) in map {
                table.insert(ShortString::from(key.as_str()), amqp_value(value));
            }
            AMQPValue::FieldTable(table)
        }
    }
}
