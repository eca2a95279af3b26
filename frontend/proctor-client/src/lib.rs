//! Client side of the proctoring pipeline: classifies browser signals into violation events,
//! queues them durably and delivers them in batches to the proctor API.

pub mod context;
pub mod detector;
pub mod error;
pub mod queue_store;
pub mod session;
pub mod sync;
pub mod transport;

pub use context::SessionContext;
pub use detector::{BrowserSignal, DetectorConfig, ViolationDetector, Warning};
pub use error::{SessionError, SyncError, SyncResult};
pub use queue_store::{FileQueueStore, MemoryQueueStore, QueueStore, QueuedEvent};
pub use session::{FocusProbe, SessionController, SessionPhase, SessionSnapshot, SubmitOutcome};
pub use sync::{FlushOutcome, SyncClient, SyncConfig};
pub use transport::{AttemptApi, EventTransport, HttpTransport};
