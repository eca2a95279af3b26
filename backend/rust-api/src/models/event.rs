use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Closed enumeration of persisted event types.
///
/// Unknown strings fail deserialization, which the JSON extractor turns into a `400`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    TabSwitch,
    WindowBlur,
    FocusRestored,
    FullscreenExit,
    FullscreenEntered,
    CopyAttempt,
    PasteAttempt,
    ContextMenu,
    /// Reserved for future detectors; nothing in this workspace emits it.
    DevtoolsDetected,
    QuestionViewed,
    AnswerSelected,
    AttemptStarted,
    AttemptSubmitted,
    TimerWarning,
}

/// Event types that increment an attempt's violation counter.
pub const VIOLATION_TYPES: [EventType; 6] = [
    EventType::TabSwitch,
    EventType::WindowBlur,
    EventType::FullscreenExit,
    EventType::CopyAttempt,
    EventType::PasteAttempt,
    EventType::ContextMenu,
];

impl EventType {
    pub fn is_violation(self) -> bool {
        VIOLATION_TYPES.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::TabSwitch => "TAB_SWITCH",
            EventType::WindowBlur => "WINDOW_BLUR",
            EventType::FocusRestored => "FOCUS_RESTORED",
            EventType::FullscreenExit => "FULLSCREEN_EXIT",
            EventType::FullscreenEntered => "FULLSCREEN_ENTERED",
            EventType::CopyAttempt => "COPY_ATTEMPT",
            EventType::PasteAttempt => "PASTE_ATTEMPT",
            EventType::ContextMenu => "CONTEXT_MENU",
            EventType::DevtoolsDetected => "DEVTOOLS_DETECTED",
            EventType::QuestionViewed => "QUESTION_VIEWED",
            EventType::AnswerSelected => "ANSWER_SELECTED",
            EventType::AttemptStarted => "ATTEMPT_STARTED",
            EventType::AttemptSubmitted => "ATTEMPT_SUBMITTED",
            EventType::TimerWarning => "TIMER_WARNING",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted occurrence tied to an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub event_type: EventType,
    pub attempt_id: String,
    #[serde(default)]
    pub question_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub immutable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_event_id: Option<String>,
}

/// Event as submitted by a client, before the ledger assigns an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    pub event_type: EventType,
    #[serde(default)]
    pub attempt_id: String,
    #[serde(default)]
    pub question_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default)]
    pub client_event_id: Option<String>,
}

impl NewEvent {
    pub fn marker(event_type: EventType, attempt_id: &str) -> Self {
        Self {
            event_type,
            attempt_id: attempt_id.to_string(),
            question_id: None,
            timestamp: None,
            metadata: None,
            client_event_id: None,
        }
    }

    /// Assigns a server id and fills the timestamp when the client sent none.
    pub fn into_event(self, now: DateTime<Utc>) -> Event {
        Event {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: self.event_type,
            attempt_id: self.attempt_id,
            question_id: self.question_id,
            timestamp: self.timestamp.unwrap_or(now),
            metadata: self.metadata.unwrap_or_default(),
            immutable: false,
            client_event_id: self.client_event_id,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchEventsRequest {
    #[serde(default)]
    pub events: Option<Vec<NewEvent>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleEventResponse {
    pub success: bool,
    pub event: Event,
    pub violation_count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEventsResponse {
    pub success: bool,
    pub inserted: usize,
    #[serde(default)]
    pub duplicates: usize,
    pub events: Vec<Event>,
}

#[derive(Debug, Serialize)]
pub struct EventListResponse {
    pub success: bool,
    pub count: usize,
    pub events: Vec<Event>,
}

/// Outcome of one atomic append against the store.
#[derive(Debug, Clone, Default)]
pub struct AppendOutcome {
    pub inserted: Vec<Event>,
    pub duplicates: usize,
    /// Violation counter of every touched attempt after the append.
    pub violation_counts: Vec<(String, u64)>,
}

impl AppendOutcome {
    pub fn violation_count_for(&self, attempt_id: &str) -> Option<u64> {
        self.violation_counts
            .iter()
            .find(|(id, _)| id == attempt_id)
            .map(|(_, count)| *count)
    }
}
