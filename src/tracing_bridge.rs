//! Bridges `tracing` events emitted inside the worker process into
//! [`LogEntry`] IPC messages (spec §4.4 steps 1-3: "install a tracing layer
//! that forwards every event as a structured log entry").
//!
//! The worker still prints to stderr via `tracing_subscriber::fmt` for local
//! visibility (e.g. when run standalone for debugging); this layer is
//! composed alongside it so every event is *also* reported to the host.

use crate::ipc::WorkerMessage;
use crate::log_entry::{LogEntry, LogLevel};
use tokio::sync::mpsc::UnboundedSender;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

pub struct TracingBridgeLayer {
    sink: UnboundedSender<WorkerMessage>,
    min_level: LogLevel,
}

impl TracingBridgeLayer {
    pub fn new(sink: UnboundedSender<WorkerMessage>, min_level: LogLevel) -> Self {
        Self { sink, min_level }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for TracingBridgeLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = LogLevel::from_tracing(event.metadata().level());
        if !level.at_least(self.min_level) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let mut entry = LogEntry::new(visitor.message.unwrap_or_default(), level)
            .with_logger(event.metadata().target());
        if let Some(file) = event.metadata().file() {
            entry = entry.with_file(file);
        }
        if let Some(line) = event.metadata().line() {
            entry = entry.with_line(line);
        }

        let _ = self.sink.send(WorkerMessage::Log { entries: vec![entry] });
    }
}
