//! Server log bridge for the cache crates' `tracing` events.
//!
//! The storage crate reports rebuilds, reclaim waits and latch timeouts
//! through `tracing`. Inside a backend those events are turned into
//! `ereport` calls: warnings and errors as WARNING, info as LOG, debug and
//! trace as DEBUG1 and DEBUG2.

use std::fmt::{self, Write};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

/// Install the bridge as the process-wide subscriber.
///
/// Does nothing if a subscriber is already installed.
pub fn install() {
    if tracing_subscriber::registry()
        .with(ServerLogLayer)
        .try_init()
        .is_err()
    {
        pgrx::debug1!("calcache: a tracing subscriber is already installed");
    }
}

struct ServerLogLayer;

impl<S: Subscriber> Layer<S> for ServerLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut text = EventText::default();
        event.record(&mut text);
        let line = text.finish();

        let level = *event.metadata().level();
        if level == Level::ERROR || level == Level::WARN {
            pgrx::warning!("calcache: {}", line);
        } else if level == Level::INFO {
            pgrx::log!("calcache: {}", line);
        } else if level == Level::DEBUG {
            pgrx::debug1!("calcache: {}", line);
        } else {
            pgrx::debug2!("calcache: {}", line);
        }
    }
}

/// Message followed by `key=value` pairs, in recording order.
#[derive(Default)]
pub(crate) struct EventText {
    message: String,
    fields: String,
}

impl EventText {
    pub(crate) fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} ({})", self.message, self.fields)
        }
    }

    fn push_field(&mut self, name: &str, value: fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push_str(", ");
        }
        let _ = write!(self.fields, "{name}={value}");
    }
}

impl Visit for EventText {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.push_field(field.name(), format_args!("{value}"));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            self.push_field(field.name(), format_args!("{value:?}"));
        }
    }
}
