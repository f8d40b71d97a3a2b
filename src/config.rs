// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Settings
//!
//! Brokers, consumers and declare options are described under a `rabbitmq`
//! section:
//!
//! ```toml
//! [rabbitmq.brokers.default]
//! virtual_host = "/integration"
//! heartbeat_interval = 60
//!
//! [rabbitmq.brokers.default.nodes.rabbit1]
//! host = "rabbit1.example.com"
//!
//! [rabbitmq.consumers.message_logger]
//! class = "logging"
//! arguments = { level = "debug" }
//! bindings = [{ exchange = "message", queue = "text", routing_key = "example.text.#" }]
//!
//! [rabbitmq.exchanges.message]
//! exchange_type = "topic"
//! durable = true
//!
//! [rabbitmq.queues.text]
//! durable = true
//! arguments = { "x-dead-letter-exchange" = "dead.letters", "x-message-ttl" = 1800000 }
//! ```
//!
//! Settings are read from a file and can be overridden with `CHEWIE__`-prefixed
//! environment variables, e.g. `CHEWIE__RABBITMQ__BROKERS__DEFAULT__PORT=5673`.

use crate::{
    broker::ConnectionParameters,
    errors::AmqpError,
    exchange::ExchangeOptions,
    queue::{Binding, QueueOptions},
    topology::TopologyConfig,
};
use config::{Config, Environment, File};
use serde::Deserialize;
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
};
use tracing::debug;

pub const ENV_PREFIX: &str = "CHEWIE";
pub const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub rabbitmq: RabbitMqSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RabbitMqSettings {
    pub brokers: HashMap<String, BrokerSettings>,
    pub consumers: HashMap<String, ConsumerSettings>,
    pub exchanges: HashMap<String, ExchangeOptions>,
    pub queues: HashMap<String, QueueOptions>,
}

impl RabbitMqSettings {
    /// Declare options for every configured exchange and queue.
    pub fn topology(&self) -> TopologyConfig {
        TopologyConfig {
            exchanges: self.exchanges.clone(),
            queues: self.queues.clone(),
        }
    }
}

/// A broker: its nodes and the options shared by all of them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerSettings {
    #[serde(default)]
    pub nodes: BTreeMap<String, ConnectionParameters>,
    #[serde(flatten)]
    pub options: ConnectionParameters,
}

/// A consumer: the registered class to build, its arguments and its bindings.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerSettings {
    pub class: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub bindings: Vec<Binding>,
    #[serde(default)]
    pub no_ack: bool,
}

/// Reads settings from `path` (format picked by extension) layered with
/// environment overrides.
pub fn load(path: impl AsRef<Path>) -> Result<Settings, AmqpError> {
    let path = path.as_ref();
    debug!(path = %path.display(), "loading settings");

    let builder = Config::builder()
        .add_source(File::from(path))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

    let config = builder
        .build()
        .map_err(|err| AmqpError::ConfigError(err.to_string()))?;

    config
        .try_deserialize()
        .map_err(|err| AmqpError::ConfigError(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeKind;
    use std::io::Write;

    const SETTINGS: &str = r#"
[rabbitmq.brokers.default]
virtual_host = "/integration"
heartbeat_interval = 60

[rabbitmq.brokers.default.nodes.rabbit1]
host = "rabbit1.example.com"
port = 5672

[rabbitmq.brokers.default.nodes.rabbit2]
host = "rabbit2.example.com"
port = 5678

[rabbitmq.consumers.message_logger]
class = "logging"
arguments = { level = "debug" }
bindings = [{ exchange = "message", queue = "text", routing_key = "example.text.#" }]

[rabbitmq.exchanges.message]
exchange_type = "topic"
durable = true
auto_delete = false

[rabbitmq.queues.text]
durable = true
exclusive = false
arguments = { "x-dead-letter-exchange" = "dead.letters", "x-message-ttl" = 1800000 }
"#;

    #[test]
    fn loads_file_and_environment_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SETTINGS.as_bytes()).unwrap();
        std::env::set_var("CHEWIE__RABBITMQ__BROKERS__DEFAULT__USERNAME", "svc");

        let settings = load(file.path()).unwrap();
        std::env::remove_var("CHEWIE__RABBITMQ__BROKERS__DEFAULT__USERNAME");

        let broker = &settings.rabbitmq.brokers["default"];
        assert_eq!(broker.nodes.len(), 2);
        assert_eq!(broker.nodes["rabbit2"].port, Some(5678));
        assert_eq!(broker.options.virtual_host.as_deref(), Some("/integration"));
        assert_eq!(broker.options.heartbeat, Some(60));
        assert_eq!(broker.options.username.as_deref(), Some("svc"));

        let consumer = &settings.rabbitmq.consumers["message_logger"];
        assert_eq!(consumer.class, "logging");
        assert_eq!(consumer.arguments["level"], "debug");
        assert_eq!(
            consumer.bindings,
            vec![Binding::new("text").exchange("message").routing_key("example.text.#")]
        );
        assert!(!consumer.no_ack);

        let topology = settings.rabbitmq.topology();
        assert_eq!(topology.exchange_options("message").kind, ExchangeKind::Topic);
        assert!(topology.queue_options("text").durable);
        assert_eq!(
            topology.queue_options("text").arguments["x-message-ttl"],
            Value::from(1_800_000)
        );
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let result = load("/nonexistent/chewie.toml");

        assert!(matches!(result, Err(AmqpError::ConfigError(_))));
    }

    #[test]
    fn sections_are_optional() {
        let settings: Settings = serde_json::from_value(serde_json::json!({
            "rabbitmq": { "brokers": { "default": {} } }
        }))
        .unwrap();

        assert!(settings.rabbitmq.brokers["default"].nodes.is_empty());
        assert!(settings.rabbitmq.consumers.is_empty());
    }
}
