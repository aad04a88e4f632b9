use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Kind of image event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageEventKind {
    Pull,
    PullError,
    Save,
}

impl std::fmt::Display for ImageEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pull => write!(f, "pull"),
            Self::PullError => write!(f, "pull-error"),
            Self::Save => write!(f, "save"),
        }
    }
}

/// Image event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageEvent {
    /// Image ID, when one is known
    pub id: Option<String>,

    /// Name the operation was invoked with (input name for pulls, output
    /// path for saves)
    pub name: String,

    /// Timestamp
    pub time: DateTime<Utc>,

    /// Event kind
    pub kind: ImageEventKind,

    /// Error text for failure events
    pub error: Option<String>,
}

impl ImageEvent {
    /// Create a new event stamped with the current time
    pub fn new(kind: ImageEventKind, id: Option<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            time: Utc::now(),
            kind,
            error: None,
        }
    }

    /// A successful pull of image `id`
    pub fn pull(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(ImageEventKind::Pull, Some(id.into()), name)
    }

    /// A failed pull of `name`
    pub fn pull_error(name: impl Into<String>, error: impl ToString) -> Self {
        let mut event = Self::new(ImageEventKind::PullError, None, name);
        event.error = Some(error.to_string());
        event
    }

    /// Image `id` was written to `path`
    pub fn save(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(ImageEventKind::Save, Some(id.into()), path)
    }
}

/// Event emitter
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<ImageEvent>>,
}

impl EventEmitter {
    /// Create a new event emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event. Having no subscribers is not an error.
    pub fn emit(&self, event: ImageEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<ImageEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let emitter = EventEmitter::new(4);
        emitter.emit(ImageEvent::pull("abc", "alpine"));
    }

    #[tokio::test]
    async fn test_subscribe_receives() {
        let emitter = EventEmitter::new(4);
        let mut rx = emitter.subscribe();
        emitter.emit(ImageEvent::pull_error("alpine", "boom"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, ImageEventKind::PullError);
        assert_eq!(event.name, "alpine");
        assert_eq!(event.error.as_deref(), Some("boom"));
        assert!(event.id.is_none());
    }

    #[test]
    fn test_event_kind_serde() {
        let json = serde_json::to_string(&ImageEventKind::PullError).unwrap();
        assert_eq!(json, "\"pull-error\"");
        assert_eq!(ImageEventKind::Save.to_string(), "save");
    }
}
