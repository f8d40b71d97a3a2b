// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module defines the seam between this crate and the broker client library.
//! The [`Connector`], [`Connection`] and [`Channel`] traits expose exactly the
//! operations the broker, agent and publisher rely on; the `Lapin*` types implement
//! them on top of `lapin`.
//!
//! Errors coming out of `lapin` are classified so that a closed channel or a lost
//! connection can be told apart from every other failure.

use crate::{
    broker::ConnectionParameters,
    errors::AmqpError,
    exchange::ExchangeOptions,
    message::Delivery,
    queue::QueueOptions,
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        ConfirmSelectOptions, QueueBindOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, ConnectionProperties,
};
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

/// Invoked at most once when a connection or channel closes unexpectedly.
pub type CloseHandler = Box<dyn FnOnce(AmqpError) + Send + 'static>;

/// Deliveries of one consumer. The stream ends when the broker cancels the consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Opens connections to a single broker node.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectionParameters)
        -> Result<Arc<dyn Connection>, AmqpError>;
}

/// An open AMQP connection.
#[async_trait]
pub trait Connection: Send + Sync {
    fn is_open(&self) -> bool;

    /// Registers the handler called when the connection is closed by the broker
    /// or the network.
    fn on_close(&self, handler: CloseHandler);

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// An open AMQP channel.
#[async_trait]
pub trait Channel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Registers the handler called when the broker closes the channel.
    fn on_close(&self, handler: CloseHandler);

    async fn exchange_declare(&self, name: &str, options: &ExchangeOptions)
        -> Result<(), AmqpError>;

    async fn queue_declare(&self, name: &str, options: &QueueOptions) -> Result<(), AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Puts the channel in confirm mode so every publish is acknowledged by the broker.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Publishes a message. In confirm mode this waits for the broker's confirmation.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;
}

/// Maps a `lapin` error onto a closed-resource error when it means the channel
/// or connection is gone, and onto `otherwise` for everything else.
pub(crate) fn lapin_error(
    err: lapin::Error,
    otherwise: impl FnOnce(String) -> AmqpError,
) -> AmqpError {
    match &err {
        lapin::Error::InvalidChannelState(_) => AmqpError::ChannelClosed(err.to_string()),
        lapin::Error::InvalidConnectionState(_) | lapin::Error::IOError(_) => {
            AmqpError::ConnectionClosed(err.to_string())
        }
        _ => otherwise(err.to_string()),
    }
}

fn once(
    handler: CloseHandler,
    closed: fn(String) -> AmqpError,
) -> impl FnMut(lapin::Error) + Send + 'static {
    let handler = Mutex::new(Some(handler));
    move |err| {
        let taken = handler.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handler) = taken {
            handler(lapin_error(err, closed));
        }
    }
}

/// Opens `lapin` connections.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(
        &self,
        params: &ConnectionParameters,
    ) -> Result<Arc<dyn Connection>, AmqpError> {
        debug!("creating amqp connection...");
        let mut options = ConnectionProperties::default();
        if let Some(name) = &params.connection_name {
            options = options.with_connection_name(LongString::from(name.as_str()));
        }

        match lapin::Connection::connect(&params.uri(), options).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(Arc::new(LapinConnection { inner: conn }))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }
}

/// A [`Connection`] backed by `lapin`.
pub struct LapinConnection {
    inner: lapin::Connection,
}

#[async_trait]
impl Connection for LapinConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn on_close(&self, handler: CloseHandler) {
        self.inner.on_error(once(handler, AmqpError::ConnectionClosed));
    }

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.inner.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { inner: channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(lapin_error(err, AmqpError::ChannelError))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(200, "closing")
            .await
            .map_err(|err| lapin_error(err, AmqpError::InternalError))
    }
}

/// A [`Channel`] backed by `lapin`.
pub struct LapinChannel {
    inner: lapin::Channel,
}

#[async_trait]
impl Channel for LapinChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn on_close(&self, handler: CloseHandler) {
        self.inner.on_error(once(handler, AmqpError::ChannelClosed));
    }

    async fn exchange_declare(
        &self,
        name: &str,
        options: &ExchangeOptions,
    ) -> Result<(), AmqpError> {
        self.inner
            .exchange_declare(
                name,
                lapin::ExchangeKind::from(&options.kind),
                options.declare_options(),
                options.arguments_table(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the exchange");
                lapin_error(err, |_| AmqpError::DeclareExchangeError(name.to_owned()))
            })
    }

    async fn queue_declare(&self, name: &str, options: &QueueOptions) -> Result<(), AmqpError> {
        self.inner
            .queue_declare(name, options.declare_options(), options.arguments_table())
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the queue");
                lapin_error(err, |_| AmqpError::DeclareQueueError(name.to_owned()))
            })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                lapin_error(err, |_| {
                    AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
                })
            })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                lapin_error(err, |_| AmqpError::BindingConsumerError(queue.to_owned()))
            })?;

        let tag = consumer_tag.to_owned();
        Ok(consumer
            .map(move |result| match result {
                Ok(delivery) => Ok(Delivery::from_lapin(&tag, delivery)),
                Err(err) => Err(lapin_error(err, AmqpError::ChannelClosed)),
            })
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| lapin_error(err, |_| AmqpError::AckMessageError(delivery_tag)))
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.inner
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| lapin_error(err, |_| AmqpError::NackMessageError(delivery_tag)))
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.inner
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| lapin_error(err, AmqpError::ConfirmSelectError))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                properties,
            )
            .await
            .map_err(|err| lapin_error(err, AmqpError::PublishingError))?;

        let confirmation = confirm
            .await
            .map_err(|err| lapin_error(err, AmqpError::PublishingError))?;

        if confirmation.is_nack() {
            return Err(AmqpError::PublishingError(
                "message was nacked by the broker".to_owned(),
            ));
        }

        Ok(())
    }
}
