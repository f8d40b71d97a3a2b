// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error type shared by the broker, agent and publisher.
//! The `AmqpError` enum distinguishes failures of a closed resource (channel or
//! connection) from every other failure, because recovery policy differs: a closed
//! resource triggers a reconnect or a single publish retry, anything else is logged
//! and surfaced.

use thiserror::Error;

/// Represents errors that can occur during AMQP operations.
///
/// Each variant names the operation that failed and carries the underlying
/// broker message (or the resource name) as context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Error establishing a connection to a broker node
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Every allowed connection attempt against the broker failed
    #[error("failure to connect to broker `{broker}` in {attempts} attempt(s)")]
    BrokerUnavailable { broker: String, attempts: u32 },

    /// The connection was closed while an operation was in flight
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// The channel was closed while an operation was in flight
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error starting a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// The broker cancelled a consumer
    #[error("consumer `{0}` was cancelled by the broker")]
    ConsumerCancelled(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error enabling publisher confirms on a channel
    #[error("failure to enable publisher confirms: {0}")]
    ConfirmSelectError(String),

    /// Error decoding or parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error serializing an outbound payload
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(u64),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`")]
    NackMessageError(u64),

    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// No consumer factory is registered under the given name
    #[error("unknown consumer class `{0}`")]
    UnknownConsumer(String),
}

impl AmqpError {
    /// Whether the error means the channel or its connection is gone.
    pub fn is_closed_resource(&self) -> bool {
        matches!(
            self,
            AmqpError::ChannelClosed(_) | AmqpError::ConnectionClosed(_)
        )
    }
}
