//! Shared test helpers: a `tracing` layer that records every event and span
//! field so tests can assert on what a dispatch logged.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;

#[derive(Clone, Debug)]
pub struct Captured {
    pub level: Level,
    pub message: String,
    pub fields: HashMap<String, String>,
}

impl Captured {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[derive(Default)]
struct Fields(HashMap<String, String>);

impl Visit for Fields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_owned(), value.to_owned());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_owned(), format!("{value:?}"));
    }
}

#[derive(Clone, Default)]
pub struct Capture {
    events: Arc<Mutex<Vec<Captured>>>,
    span_fields: Arc<Mutex<HashMap<String, String>>>,
}

impl Capture {
    pub fn events(&self) -> Vec<Captured> {
        self.events.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.message.clone()).collect()
    }

    pub fn named(&self, message: &str) -> Vec<Captured> {
        self.events.lock().iter().filter(|e| e.message == message).cloned().collect()
    }

    /// Latest value of a span field, from creation or a later `record`.
    pub fn span_field(&self, name: &str) -> Option<String> {
        self.span_fields.lock().get(name).cloned()
    }

    /// Everything captured, flattened into one string.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for e in self.events.lock().iter() {
            out.push_str(&format!("{} {} {:?}\n", e.level, e.message, e.fields));
        }
        out.push_str(&format!("{:?}", self.span_fields.lock()));
        out
    }
}

impl<S: Subscriber> Layer<S> for Capture {
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        let mut fields = Fields::default();
        attrs.record(&mut fields);
        self.span_fields.lock().extend(fields.0);
    }

    fn on_record(&self, _id: &Id, values: &Record<'_>, _ctx: Context<'_, S>) {
        let mut fields = Fields::default();
        values.record(&mut fields);
        self.span_fields.lock().extend(fields.0);
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = Fields::default();
        event.record(&mut fields);
        let message = fields.0.remove("message").unwrap_or_default();
        self.events.lock().push(Captured { level: *event.metadata().level(), message, fields: fields.0 });
    }
}

/// Routes this thread's events into a fresh [`Capture`] until the guard drops.
pub fn capture() -> (Capture, DefaultGuard) {
    let capture = Capture::default();
    let guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(capture.clone()));
    (capture, guard)
}
