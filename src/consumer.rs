// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumers
//!
//! A [`Consumer`] holds the application logic run for every delivered message. It
//! reports how processing went through [`ConsumerError`]; the agent maps each
//! result onto an [`Outcome`] that decides whether the message is acknowledged,
//! rejected, or whether the agent reconnects or stops.

use crate::{errors::AmqpError, message::Message};
use async_trait::async_trait;
use opentelemetry::Context;
use std::error::Error as StdError;
use thiserror::Error;

/// Application logic for one kind of message.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Processes one message. Returning `Ok(())` makes it eligible for acknowledgment.
    async fn process(&self, ctx: &Context, message: &Message) -> Result<(), ConsumerError>;
}

/// Failures a [`Consumer`] can report.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Processing failed for a transient reason; the message is requeued.
    #[error("recoverable consumer error: {0}")]
    Recoverable(String),

    /// The message itself cannot be processed; it is discarded (or dead-lettered).
    #[error("unprocessable message: {0}")]
    Message(String),

    #[error("channel closed during processing: {0}")]
    ChannelClosed(String),

    #[error("connection closed during processing: {0}")]
    ConnectionClosed(String),

    /// Processing was interrupted by a shutdown request.
    #[error("processing interrupted")]
    Interrupted,

    #[error("unexpected consumer error: {0}")]
    Unexpected(Box<dyn StdError + Send + Sync>),
}

impl ConsumerError {
    pub fn unexpected(err: impl StdError + Send + Sync + 'static) -> ConsumerError {
        ConsumerError::Unexpected(Box::new(err))
    }
}

impl From<AmqpError> for ConsumerError {
    fn from(err: AmqpError) -> ConsumerError {
        match err {
            AmqpError::ChannelClosed(msg) => ConsumerError::ChannelClosed(msg),
            AmqpError::ConnectionClosed(msg) => ConsumerError::ConnectionClosed(msg),
            AmqpError::ParsePayloadError(msg) => ConsumerError::Message(msg),
            other => ConsumerError::unexpected(other),
        }
    }
}

/// What the agent does with a message once its consumer returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Processed; acknowledged when the agent runs in ack mode.
    Success,
    /// Rejected with requeue; the agent keeps consuming.
    Requeue,
    /// Rejected without requeue; the agent keeps consuming.
    Discard,
    /// The channel or connection went away; the agent reconnects.
    Reconnect,
    /// Rejected with requeue, then the agent stops.
    Stop,
}

impl Outcome {
    pub fn of(result: &Result<(), ConsumerError>) -> Outcome {
        match result {
            Ok(()) => Outcome::Success,
            Err(ConsumerError::Recoverable(_)) | Err(ConsumerError::Unexpected(_)) => {
                Outcome::Requeue
            }
            Err(ConsumerError::Message(_)) => Outcome::Discard,
            Err(ConsumerError::ChannelClosed(_)) | Err(ConsumerError::ConnectionClosed(_)) => {
                Outcome::Reconnect
            }
            Err(ConsumerError::Interrupted) => Outcome::Stop,
        }
    }

    /// `Some(requeue)` when the message must be rejected.
    pub fn reject(self) -> Option<bool> {
        match self {
            Outcome::Requeue | Outcome::Stop => Some(true),
            Outcome::Discard => Some(false),
            Outcome::Success | Outcome::Reconnect => None,
        }
    }

    pub fn reconnect(self) -> bool {
        self == Outcome::Reconnect
    }

    pub fn stop(self) -> bool {
        self == Outcome::Stop
    }

    pub fn ack_eligible(self) -> bool {
        self == Outcome::Success
    }
}
