//! Logging setup and structured session events.
//!
//! All components log through `tracing`. Session lifecycle milestones are
//! additionally emitted as a single JSON `LogEvent` so log aggregation can
//! filter on `event_type` and correlate on the session id.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    // Already installed (tests, repeated init) is fine.
    let _ = result;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStarted,
    SessionCompleted,
    SessionFailed,
    SessionTimeout,
    CoordinatorElected,
    ReadyReceived,
    IntentAccepted,
    IntentRejected,
    SignatureCached,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SessionStarted => "session_started",
            EventType::SessionCompleted => "session_completed",
            EventType::SessionFailed => "session_failed",
            EventType::SessionTimeout => "session_timeout",
            EventType::CoordinatorElected => "coordinator_elected",
            EventType::ReadyReceived => "ready_received",
            EventType::IntentAccepted => "intent_accepted",
            EventType::IntentRejected => "intent_rejected",
            EventType::SignatureCached => "signature_cached",
        }
    }

    fn is_failure(&self) -> bool {
        matches!(
            self,
            EventType::SessionFailed | EventType::SessionTimeout | EventType::IntentRejected
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One session milestone, logged as a single JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub event_type: EventType,
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LogEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            timestamp_ms: chrono::Utc::now().timestamp_millis().max(0) as u64,
            session_id: None,
            peer: None,
            protocol: None,
            elapsed_ms: None,
            fields: BTreeMap::new(),
            error: None,
        }
    }

    pub fn session(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn peer(mut self, peer: impl ToString) -> Self {
        self.peer = Some(peer.to_string());
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed_ms = Some(elapsed.as_millis() as u64);
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.fields.insert(key.into(), value.to_string());
        self
    }

    pub fn error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn emit(&self) {
        let json = match serde_json::to_string(self) {
            Ok(json) => json,
            Err(_) => return,
        };
        if self.event_type.is_failure() {
            tracing::warn!(event_type = %self.event_type, event = %json, "session_event");
        } else {
            tracing::info!(event_type = %self.event_type, event = %json, "session_event");
        }
    }
}

/// Emits start, coordinator and end events for one protocol run.
pub struct SessionSpan {
    session_id: String,
    protocol: String,
    started: Instant,
}

impl SessionSpan {
    pub fn new(session_id: impl Into<String>, protocol: impl Into<String>) -> Self {
        let span = Self {
            session_id: session_id.into(),
            protocol: protocol.into(),
            started: Instant::now(),
        };
        span.event(EventType::SessionStarted).emit();
        span
    }

    fn event(&self, event_type: EventType) -> LogEvent {
        LogEvent::new(event_type)
            .session(&self.session_id)
            .protocol(&self.protocol)
    }

    pub fn record_coordinator(&self, coordinator: &str, is_self: bool) {
        self.event(EventType::CoordinatorElected)
            .peer(coordinator)
            .field("is_self", is_self)
            .emit();
    }

    pub fn complete(self) -> Duration {
        let elapsed = self.started.elapsed();
        self.event(EventType::SessionCompleted).elapsed(elapsed).emit();
        elapsed
    }

    pub fn fail(self, error: impl ToString) -> Duration {
        let elapsed = self.started.elapsed();
        self.event(EventType::SessionFailed)
            .elapsed(elapsed)
            .error(error)
            .emit();
        elapsed
    }
}
