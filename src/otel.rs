// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Trace context travels in the AMQP header table as plain string values.
//! `HeaderCarrier` is the string map the propagator writes to and reads from;
//! converting it to and from a `FieldTable` is kept separate so the propagator
//! never touches AMQP value types.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector, TextMapPropagator},
    trace::{SpanKind, Tracer},
    Context, KeyValue,
};
use std::{borrow::Cow, collections::HashMap};
use tracing::{error, warn};

/// Name of the tracer used for producer spans
pub const PRODUCER_TRACER: &str = "amqp producer";
/// Name of the tracer used for consumer spans
pub const CONSUMER_TRACER: &str = "amqp consumer";

/// String-keyed carrier for trace context headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderCarrier {
    values: HashMap<String, String>,
}

impl HeaderCarrier {
    pub fn new() -> Self {
        HeaderCarrier::default()
    }

    /// Collects the string-typed entries of an AMQP header table.
    ///
    /// Non-string values, and strings that are not valid UTF-8, are skipped.
    pub fn from_headers(headers: &FieldTable) -> Self {
        let values = headers
            .inner()
            .iter()
            .filter_map(|(key, value)| {
                let value = match value {
                    AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes())
                        .map_err(|e| error!("Error decoding header value {:?}", e))
                        .ok()?
                        .to_owned(),
                    AMQPValue::ShortString(v) => v.as_str().to_owned(),
                    _ => return None,
                };
                Some((key.as_str().to_owned(), value))
            })
            .collect();

        HeaderCarrier { values }
    }

    /// Unions the carrier into `headers`.
    ///
    /// A key the caller already set keeps the caller's value; the conflict is
    /// logged.
    pub fn merge_into(self, headers: &mut FieldTable) {
        for (key, value) in self.values {
            if headers.inner().contains_key(key.as_str()) {
                warn!(key = key, "header already set by the caller, keeping it");
                continue;
            }

            headers.insert(
                ShortString::from(key),
                AMQPValue::LongString(LongString::from(value)),
            );
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Injector for HeaderCarrier {
    fn set(&mut self, key: &str, value: String) {
        self.values.insert(key.to_lowercase(), value);
    }
}

impl Extractor for HeaderCarrier {
    fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.values.keys().map(String::as_str).collect()
    }
}

/// Writes the trace context of `ctx` into `headers` using `propagator`.
pub fn inject_context_with(
    propagator: &dyn TextMapPropagator,
    ctx: &Context,
    headers: &mut FieldTable,
) {
    let mut carrier = HeaderCarrier::new();
    propagator.inject_context(ctx, &mut carrier);
    carrier.merge_into(headers);
}

/// Reads a trace context from `headers` using `propagator`.
///
/// Missing or malformed headers give a context without a valid span, never
/// an error.
pub fn extract_context_with(propagator: &dyn TextMapPropagator, headers: &FieldTable) -> Context {
    propagator.extract(&HeaderCarrier::from_headers(headers))
}

/// `inject_context_with` using the global propagator.
pub fn inject_context(ctx: &Context, headers: &mut FieldTable) {
    global::get_text_map_propagator(|propagator| inject_context_with(propagator, ctx, headers))
}

/// `extract_context_with` using the global propagator.
pub fn extract_context(headers: &FieldTable) -> Context {
    global::get_text_map_propagator(|propagator| extract_context_with(propagator, headers))
}

/// Starts a span of `kind` named `name` as a child of `parent`.
pub(crate) fn new_span(
    tracer: &BoxedTracer,
    parent: &Context,
    name: &str,
    kind: SpanKind,
    attributes: Vec<KeyValue>,
) -> BoxedSpan {
    tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(kind)
        .with_attributes(attributes)
        .start_with_context(tracer, parent)
}
