pub mod attempt;
pub mod event;

pub use attempt::{
    Attempt, AttemptListResponse, AttemptMetadata, AttemptResponse, AttemptStatus,
    StartAttemptRequest, StartAttemptResponse, SubmitAttemptRequest,
};
pub use event::{
    AppendOutcome, BatchEventsRequest, BatchEventsResponse, Event, EventListResponse, EventType,
    NewEvent, SingleEventResponse, VIOLATION_TYPES,
};
