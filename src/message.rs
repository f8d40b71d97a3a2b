// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivered Messages
//!
//! A [`Message`] wraps one delivery handed to a consumer: the routing metadata
//! of the `Basic.Deliver` method, the normalized [`Properties`], and an owned copy
//! of the body. Derived values (lower-cased content type and encoding, creation and
//! expiry times, the decompressed body and the decoded payload) are computed on
//! first access and cached for the lifetime of the message.

use crate::{channel::Channel, errors::AmqpError, properties::Properties};
use bzip2::read::BzDecoder;
use chrono::{DateTime, Duration, Utc};
use flate2::read::{GzDecoder, ZlibDecoder};
use lapin::{types::FieldTable, BasicProperties};
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use std::{fmt, io::Read, sync::Arc};

/// Content type whose bodies are decoded as JSON
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content encoding for zlib/gzip compressed bodies
pub const GZIP_CONTENT_ENCODING: &str = "gzip";
/// Content encoding for bzip2 compressed bodies
pub const BZIP2_CONTENT_ENCODING: &str = "bzip2";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Routing metadata of a `Basic.Deliver` method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryMethod {
    pub consumer_tag: String,
    /// Only meaningful on the channel the message arrived on.
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
}

/// A raw delivery as produced by a consumer stream.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub method: DeliveryMethod,
    pub header: BasicProperties,
    pub body: Vec<u8>,
}

impl Delivery {
    pub(crate) fn from_lapin(consumer_tag: &str, delivery: lapin::message::Delivery) -> Self {
        Delivery {
            method: DeliveryMethod {
                consumer_tag: consumer_tag.to_owned(),
                delivery_tag: delivery.delivery_tag,
                exchange: delivery.exchange.as_str().to_owned(),
                routing_key: delivery.routing_key.as_str().to_owned(),
                redelivered: delivery.redelivered,
            },
            header: delivery.properties,
            body: delivery.data,
        }
    }
}

/// The decoded contents of a message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Body of an `application/json` message.
    Json(serde_json::Value),
    /// Decompressed body of any other content type.
    Raw(Vec<u8>),
}

impl Payload {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Raw(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Json(_) => None,
            Payload::Raw(bytes) => Some(bytes),
        }
    }
}

/// A message delivered by the broker.
pub struct Message {
    channel: Arc<dyn Channel>,
    method: DeliveryMethod,
    properties: Properties,
    body: Vec<u8>,

    content_type: OnceCell<Option<String>>,
    content_encoding: OnceCell<Option<String>>,
    created_at: OnceCell<Option<DateTime<Utc>>>,
    expires_at: OnceCell<Option<DateTime<Utc>>>,
    decoded_body: OnceCell<Vec<u8>>,
    payload: OnceCell<Payload>,
}

impl Message {
    pub fn new(
        channel: Arc<dyn Channel>,
        method: DeliveryMethod,
        header: &BasicProperties,
        body: &[u8],
    ) -> Message {
        Message {
            channel,
            method,
            properties: Properties::from(header),
            body: body.to_vec(),
            content_type: OnceCell::new(),
            content_encoding: OnceCell::new(),
            created_at: OnceCell::new(),
            expires_at: OnceCell::new(),
            decoded_body: OnceCell::new(),
            payload: OnceCell::new(),
        }
    }

    /// The channel the message arrived on.
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn method(&self) -> &DeliveryMethod {
        &self.method
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn consumer_tag(&self) -> &str {
        &self.method.consumer_tag
    }

    pub fn delivery_tag(&self) -> u64 {
        self.method.delivery_tag
    }

    pub fn exchange(&self) -> &str {
        &self.method.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.method.routing_key
    }

    pub fn redelivered(&self) -> bool {
        self.method.redelivered
    }

    pub fn app_id(&self) -> Option<&str> {
        self.properties.app_id.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id.as_deref()
    }

    pub fn headers(&self) -> &FieldTable {
        &self.properties.headers
    }

    pub fn id(&self) -> Option<&str> {
        self.properties.message_id.as_deref()
    }

    pub fn priority(&self) -> Option<u8> {
        self.properties.priority
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to.as_deref()
    }

    pub fn kind(&self) -> Option<&str> {
        self.properties.kind.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.properties.user_id.as_deref()
    }

    /// Lower-cased content type, `None` when unset or empty.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type
            .get_or_init(|| lowercase(&self.properties.content_type))
            .as_deref()
    }

    /// Lower-cased content encoding, `None` when unset or empty.
    pub fn content_encoding(&self) -> Option<&str> {
        self.content_encoding
            .get_or_init(|| lowercase(&self.properties.content_encoding))
            .as_deref()
    }

    /// Creation time taken from the timestamp property.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        *self.created_at.get_or_init(|| match self.properties.timestamp {
            Some(ts) if ts > 0 => DateTime::from_timestamp(ts as i64, 0),
            _ => None,
        })
    }

    /// Creation time plus the expiration TTL. `None` unless both are present and
    /// the expiration parses as a non-negative count of milliseconds.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        *self.expires_at.get_or_init(|| {
            let created_at = self.created_at()?;
            let ttl = self.properties.expiration.as_deref()?.trim().parse::<u64>().ok()?;
            let ttl = Duration::try_milliseconds(i64::try_from(ttl).ok()?)?;
            created_at.checked_add_signed(ttl)
        })
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether the message had expired at `now`. The expiry instant itself counts
    /// as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|expires_at| expires_at <= now)
    }

    /// The body after undoing the content encoding.
    pub fn decoded_body(&self) -> Result<&[u8], AmqpError> {
        self.decoded_body
            .get_or_try_init(|| decode(self.content_encoding(), &self.body))
            .map(Vec::as_slice)
    }

    /// The decoded body, deserialized when the content type is JSON.
    pub fn payload(&self) -> Result<&Payload, AmqpError> {
        self.payload.get_or_try_init(|| {
            let decoded = self.decoded_body()?;

            if self.content_type() == Some(JSON_CONTENT_TYPE) {
                serde_json::from_slice(decoded)
                    .map(Payload::Json)
                    .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
            } else {
                Ok(Payload::Raw(decoded.to_vec()))
            }
        })
    }

    /// Deserializes the decoded body as JSON into `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(self.decoded_body()?)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("method", &self.method)
            .field("properties", &self.properties)
            .field("body_len", &self.body.len())
            .finish()
    }
}

fn lowercase(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::to_lowercase)
        .filter(|v| !v.is_empty())
}

fn decode(encoding: Option<&str>, body: &[u8]) -> Result<Vec<u8>, AmqpError> {
    let mut out = Vec::new();

    let result = match encoding {
        Some(BZIP2_CONTENT_ENCODING) => BzDecoder::new(body).read_to_end(&mut out),
        Some(GZIP_CONTENT_ENCODING) if body.starts_with(&GZIP_MAGIC) => {
            GzDecoder::new(body).read_to_end(&mut out)
        }
        Some(GZIP_CONTENT_ENCODING) => ZlibDecoder::new(body).read_to_end(&mut out),
        _ => return Ok(body.to_vec()),
    };

    result
        .map(|_| out)
        .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
}
