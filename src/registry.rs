// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Building Agents from Settings
//!
//! Consumers are named in settings by class. A [`ConsumerRegistry`] maps each class
//! name to a factory that builds the consumer from its configured `arguments`; the
//! helpers below then assemble brokers and agents from [`Settings`].

use crate::{
    agent::ConsumerAgent,
    broker::Broker,
    config::{BrokerSettings, ConsumerSettings, Settings},
    consumer::Consumer,
    errors::AmqpError,
};
use serde_json::Value;
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::{debug, error};

pub type ConsumerFactory =
    Arc<dyn Fn(&Value) -> Result<Arc<dyn Consumer>, AmqpError> + Send + Sync + 'static>;

/// Consumer factories keyed by class name.
#[derive(Clone, Default)]
pub struct ConsumerRegistry {
    factories: HashMap<String, ConsumerFactory>,
}

impl ConsumerRegistry {
    pub fn new() -> ConsumerRegistry {
        ConsumerRegistry::default()
    }

    pub fn register<F>(mut self, class: &str, factory: F) -> Self
    where
        F: Fn(&Value) -> Result<Arc<dyn Consumer>, AmqpError> + Send + Sync + 'static,
    {
        self.factories.insert(class.to_owned(), Arc::new(factory));
        self
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    /// Builds a consumer of `class` from its arguments.
    pub fn create(&self, class: &str, arguments: &Value) -> Result<Arc<dyn Consumer>, AmqpError> {
        let Some(factory) = self.factories.get(class) else {
            error!(class, "no consumer registered under this class");
            return Err(AmqpError::UnknownConsumer(class.to_owned()));
        };

        debug!(class, "creating consumer");
        factory(arguments)
    }
}

impl fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerRegistry")
            .field("classes", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub fn consumer_from_config(
    registry: &ConsumerRegistry,
    settings: &ConsumerSettings,
) -> Result<Arc<dyn Consumer>, AmqpError> {
    registry.create(&settings.class, &settings.arguments)
}

pub fn broker_from_config(name: &str, settings: &BrokerSettings) -> Broker {
    Broker::new(settings.nodes.clone(), settings.options.clone()).with_name(name)
}

/// Builds the agent for the consumer `name`, connected through the broker `broker`.
pub fn consumer_agent_from_config(
    settings: &Settings,
    registry: &ConsumerRegistry,
    name: &str,
    broker: &str,
) -> Result<ConsumerAgent, AmqpError> {
    let rabbitmq = &settings.rabbitmq;

    let consumer_settings = rabbitmq
        .consumers
        .get(name)
        .ok_or_else(|| AmqpError::ConfigError(format!("no consumer named `{name}`")))?;
    let broker_settings = rabbitmq
        .brokers
        .get(broker)
        .ok_or_else(|| AmqpError::ConfigError(format!("no broker named `{broker}`")))?;

    let consumer = consumer_from_config(registry, consumer_settings)?;
    let broker = broker_from_config(broker, broker_settings);

    Ok(ConsumerAgent::new(
        consumer,
        Arc::new(broker),
        consumer_settings.bindings.clone(),
        consumer_settings.no_ack,
        rabbitmq.topology(),
    ))
}
