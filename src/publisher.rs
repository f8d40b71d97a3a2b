// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module provides the [`Publisher`], which publishes messages to RabbitMQ
//! exchanges on a cached confirm-mode channel. Each publish waits for the broker's
//! confirmation. When the cached channel or its connection turns out to be closed,
//! the publish is retried exactly once on a fresh channel; a second failure is
//! returned to the caller.
//!
//! The current OpenTelemetry context is propagated in the message headers.

use crate::{
    broker::{Broker, ConnectOptions},
    channel::{Channel, Connection},
    errors::AmqpError,
    message::JSON_CONTENT_TYPE,
    otel,
    properties::Properties,
};
use chrono::Utc;
use lapin::{types::ShortString, BasicProperties};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

struct Session {
    connection: Arc<dyn Connection>,
    channel: Arc<dyn Channel>,
}

/// Publishes messages to a [`Broker`].
pub struct Publisher {
    broker: Arc<Broker>,
    session: Mutex<Option<Session>>,
}

impl Publisher {
    /// Creates a publisher. No connection is opened until the first publish.
    pub fn new(broker: Arc<Broker>) -> Publisher {
        Publisher {
            broker,
            session: Mutex::new(None),
        }
    }

    /// Publishes `body` to `exchange` with `routing_key`.
    ///
    /// Without `properties` the message is sent with no properties at all.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: Option<&Properties>,
    ) -> Result<(), AmqpError> {
        let properties = properties.map(build_basic_properties).unwrap_or_default();

        let channel = self.channel().await?;
        match channel
            .basic_publish(exchange, routing_key, body, properties.clone())
            .await
        {
            Err(err) if err.is_closed_resource() => {
                warn!(error = err.to_string(), "cannot publish on existing channel");
                info!("attempting to republish on new channel");
                self.invalidate().await;

                let channel = self.channel().await?;
                channel
                    .basic_publish(exchange, routing_key, body, properties)
                    .await
            }
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(err)
            }
            Ok(()) => {
                debug!(exchange, routing_key, "message published");
                Ok(())
            }
        }
    }

    /// Serializes `payload` as JSON and publishes it as `application/json`.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        properties: Option<&Properties>,
    ) -> Result<(), AmqpError> {
        let body = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "error serializing payload");
            AmqpError::SerializePayloadError(err.to_string())
        })?;

        let properties = properties
            .cloned()
            .unwrap_or_else(Properties::empty)
            .with_content_type(JSON_CONTENT_TYPE);

        self.publish(exchange, routing_key, &body, Some(&properties))
            .await
    }

    /// Returns the cached channel, opening a new confirm-mode channel when there is
    /// none or it was closed.
    async fn channel(&self) -> Result<Arc<dyn Channel>, AmqpError> {
        let mut session = self.session.lock().await;
        if let Some(current) = session.as_ref() {
            if current.channel.is_open() {
                return Ok(current.channel.clone());
            }
        }

        if let Some(stale) = session.take() {
            close(stale.connection);
        }

        let connection = self
            .broker
            .connect(ConnectOptions::blocking())
            .await?
            .ok_or_else(|| AmqpError::ConnectionError(self.broker.name().to_owned()))?;
        let channel = connection.create_channel().await?;
        channel.confirm_select().await?;
        debug!(broker = %self.broker.name(), "publisher channel ready");

        *session = Some(Session {
            connection,
            channel: channel.clone(),
        });
        Ok(channel)
    }

    async fn invalidate(&self) {
        if let Some(stale) = self.session.lock().await.take() {
            close(stale.connection);
        }
    }
}

fn close(connection: Arc<dyn Connection>) {
    if connection.is_open() {
        tokio::spawn(async move {
            let _ = connection.close().await;
        });
    }
}

/// Translates [`Properties`] into wire properties.
///
/// Only set attributes are copied and the cluster id is never sent. The timestamp
/// defaults to the current epoch second and headers are only attached when there
/// is at least one, trace context included.
pub(crate) fn build_basic_properties(properties: &Properties) -> BasicProperties {
    let text = |value: &str| ShortString::from(value);
    let mut basic = BasicProperties::default();

    if let Some(value) = &properties.app_id {
        basic = basic.with_app_id(text(value));
    }
    if let Some(value) = &properties.content_encoding {
        basic = basic.with_content_encoding(text(value));
    }
    if let Some(value) = &properties.content_type {
        basic = basic.with_content_type(text(value));
    }
    if let Some(value) = &properties.correlation_id {
        basic = basic.with_correlation_id(text(value));
    }
    if let Some(value) = properties.delivery_mode {
        basic = basic.with_delivery_mode(value);
    }
    if let Some(value) = properties.priority {
        basic = basic.with_priority(value);
    }
    if let Some(value) = &properties.reply_to {
        basic = basic.with_reply_to(text(value));
    }
    if let Some(value) = &properties.message_id {
        basic = basic.with_message_id(text(value));
    }
    if let Some(value) = &properties.kind {
        basic = basic.with_type(text(value));
    }
    if let Some(value) = &properties.user_id {
        basic = basic.with_user_id(text(value));
    }

    let timestamp = properties
        .timestamp
        .unwrap_or_else(|| Utc::now().timestamp() as u64);
    basic = basic.with_timestamp(timestamp);

    if let Some(value) = &properties.expiration {
        basic = basic.with_expiration(text(value));
    }

    let mut headers = properties.headers.clone();
    otel::inject_context(&mut headers);
    if !headers.inner().is_empty() {
        basic = basic.with_headers(headers);
    }

    basic
}
