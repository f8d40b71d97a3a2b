// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Properties
//!
//! Normalized representation of the AMQP `Basic.Properties` carried by every
//! message. Inbound properties are copied from the broker library's header;
//! outbound properties are built with [`Properties::default`] and the `with_*`
//! methods, then translated to wire properties by the publisher.

use chrono::Utc;
use lapin::{types::FieldTable, BasicProperties};
use uuid::Uuid;

/// Default content type for messages built without explicit properties
pub const DEFAULT_CONTENT_TYPE: &str = "text/text";
/// Non-persistent delivery mode
pub const DEFAULT_DELIVERY_MODE: u8 = 1;

/// Attributes defined in AMQP's `Basic.Properties`.
#[derive(Debug, Clone)]
pub struct Properties {
    pub app_id: Option<String>,
    /// Inbound only; never copied onto published messages.
    pub cluster_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub correlation_id: Option<String>,
    pub delivery_mode: Option<u8>,
    /// Time-to-live in milliseconds, as the protocol carries it.
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub priority: Option<u8>,
    pub reply_to: Option<String>,
    /// Seconds since the epoch.
    pub timestamp: Option<u64>,
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub headers: FieldTable,
}

impl Default for Properties {
    /// Properties for an outbound message: `text/text`, delivery mode 1, a
    /// fresh message id and the current epoch second.
    fn default() -> Self {
        Properties {
            app_id: None,
            cluster_id: None,
            content_type: Some(DEFAULT_CONTENT_TYPE.to_owned()),
            content_encoding: None,
            correlation_id: None,
            delivery_mode: Some(DEFAULT_DELIVERY_MODE),
            expiration: None,
            message_id: Some(Uuid::new_v4().to_string()),
            priority: None,
            reply_to: None,
            timestamp: Some(Utc::now().timestamp() as u64),
            kind: None,
            user_id: None,
            headers: FieldTable::default(),
        }
    }
}

impl From<&BasicProperties> for Properties {
    /// Copies every attribute verbatim. Headers are cloned into an owned table
    /// so the result never aliases the delivery's buffer.
    fn from(header: &BasicProperties) -> Self {
        let text = |v: &Option<lapin::types::ShortString>| v.as_ref().map(|s| s.as_str().to_owned());

        Properties {
            app_id: text(header.app_id()),
            cluster_id: text(header.cluster_id()),
            content_type: text(header.content_type()),
            content_encoding: text(header.content_encoding()),
            correlation_id: text(header.correlation_id()),
            delivery_mode: *header.delivery_mode(),
            expiration: text(header.expiration()),
            message_id: text(header.message_id()),
            priority: *header.priority(),
            reply_to: text(header.reply_to()),
            timestamp: *header.timestamp(),
            kind: text(header.kind()),
            user_id: text(header.user_id()),
            headers: header.headers().clone().unwrap_or_default(),
        }
    }
}

impl Properties {
    /// Properties with every attribute unset, including headers.
    pub fn empty() -> Self {
        Properties {
            app_id: None,
            cluster_id: None,
            content_type: None,
            content_encoding: None,
            correlation_id: None,
            delivery_mode: None,
            expiration: None,
            message_id: None,
            priority: None,
            reply_to: None,
            timestamp: None,
            kind: None,
            user_id: None,
            headers: FieldTable::default(),
        }
    }

    pub fn with_app_id(mut self, app_id: &str) -> Self {
        self.app_id = Some(app_id.to_owned());
        self
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn with_content_encoding(mut self, content_encoding: &str) -> Self {
        self.content_encoding = Some(content_encoding.to_owned());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_owned());
        self
    }

    pub fn with_delivery_mode(mut self, delivery_mode: u8) -> Self {
        self.delivery_mode = Some(delivery_mode);
        self
    }

    /// Sets the per-message TTL in milliseconds.
    pub fn with_expiration(mut self, millis: u64) -> Self {
        self.expiration = Some(millis.to_string());
        self
    }

    pub fn with_message_id(mut self, message_id: &str) -> Self {
        self.message_id = Some(message_id.to_owned());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_owned());
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    pub fn with_user_id(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_owned());
        self
    }

    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.headers = headers;
        self
    }
}
