// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels in AMQP message headers. Deliveries are processed inside a
//! consumer span whose parent is extracted from the incoming headers, and published
//! messages carry the publisher's current context.

use lapin::types::{AMQPValue, FieldTable, ShortString};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;
use tracing::error;

/// Name of the tracer used for consumer spans.
pub const TRACER_NAME: &str = "amqp consumer";

/// Reads trace context out of message headers.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a FieldTable,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a FieldTable) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.inner().get(key).and_then(|value| match value {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                .map_err(|e| error!("Error decoding header value {:?}", e))
                .ok(),
            AMQPValue::ShortString(value) => Some(value.as_str()),
            _ => None,
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.inner().keys().map(|key| key.as_str()).collect()
    }
}

/// Writes trace context into message headers.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut FieldTable,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut FieldTable) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            ShortString::from(key.to_lowercase()),
            AMQPValue::LongString(value.into()),
        );
    }
}

/// Adds the current trace context to outgoing headers.
///
/// Leaves `headers` untouched when no propagator is installed.
pub(crate) fn inject_context(headers: &mut FieldTable) {
    let ctx = Context::current();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut HeaderInjector::new(headers))
    });
}

/// Creates a consumer span for one delivery, parented on the context carried in
/// its headers.
///
/// # Returns
/// A tuple containing the extracted context and the new span
pub fn new_span(headers: &FieldTable, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
