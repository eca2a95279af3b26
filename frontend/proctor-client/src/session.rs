use std::collections::BTreeMap;
use std::sync::Arc;

use proctor_api::models::{Attempt, AttemptMetadata, EventType, StartAttemptRequest};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use crate::context::SessionContext;
use crate::detector::{BlurCheck, BrowserSignal, Detection, DetectorConfig, ViolationDetector, Warning};
use crate::error::{SessionError, SyncError};
use crate::sync::SyncClient;
use crate::transport::AttemptApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    NotStarted,
    Active,
    Submitting,
    Submitted,
}

/// Answers whether the test window currently holds focus.
pub trait FocusProbe: Send + Sync {
    fn has_focus(&self) -> bool;
}

/// Persistable session state for resuming after a reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub context: SessionContext,
    pub phase: SessionPhase,
    pub has_ever_entered_fullscreen: bool,
    pub violation_count: u64,
    #[serde(default)]
    pub answers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalOutcome {
    pub prevent_default: bool,
    pub logged: Vec<EventType>,
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Submitted(Attempt),
    /// The server had already locked the attempt; treated as done.
    AlreadySubmitted,
}

struct SessionState {
    context: SessionContext,
    phase: SessionPhase,
    detector: ViolationDetector,
    answers: BTreeMap<String, String>,
    warnings: Vec<Warning>,
    blur_task: Option<AbortHandle>,
}

impl SessionState {
    fn require(&self, phase: SessionPhase) -> Result<(), SessionError> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(SessionError::InvalidPhase(self.phase))
        }
    }

    fn cancel_blur_task(&mut self) {
        if let Some(task) = self.blur_task.take() {
            task.abort();
        }
    }
}

/// Drives one attempt: not started, active from the first fullscreen entry, submitting while
/// the confirmation is shown, then submitted for good.
#[derive(Clone)]
pub struct SessionController {
    state: Arc<Mutex<SessionState>>,
    sync: SyncClient,
    api: Arc<dyn AttemptApi>,
    probe: Arc<dyn FocusProbe>,
    config: DetectorConfig,
}

impl SessionController {
    pub fn new(
        context: SessionContext,
        sync: SyncClient,
        api: Arc<dyn AttemptApi>,
        probe: Arc<dyn FocusProbe>,
        config: DetectorConfig,
    ) -> Self {
        let state = SessionState {
            context,
            phase: SessionPhase::NotStarted,
            detector: ViolationDetector::new(),
            answers: BTreeMap::new(),
            warnings: Vec::new(),
            blur_task: None,
        };
        Self::with_state(state, sync, api, probe, config)
    }

    /// Rebuilds a controller from a snapshot. An interrupted submit confirmation resumes as active.
    ///
    /// The persisted event queue is loaded before anything new can be logged over it.
    pub async fn resume(
        snapshot: SessionSnapshot,
        sync: SyncClient,
        api: Arc<dyn AttemptApi>,
        probe: Arc<dyn FocusProbe>,
        config: DetectorConfig,
    ) -> Result<Self, SessionError> {
        let restored = sync.load().await?;
        tracing::debug!(restored, "Restored queued events on resume");

        let mut detector =
            ViolationDetector::restore(snapshot.has_ever_entered_fullscreen, snapshot.violation_count);
        let phase = match snapshot.phase {
            SessionPhase::Submitted => {
                detector.mark_submitted();
                SessionPhase::Submitted
            }
            _ if snapshot.context.attempt_id.is_none() => SessionPhase::NotStarted,
            SessionPhase::Submitting => SessionPhase::Active,
            phase => phase,
        };
        if phase != SessionPhase::Submitted && snapshot.context.attempt_id.is_some() {
            detector.attach();
            sync.start();
        }

        let state = SessionState {
            context: snapshot.context,
            phase,
            detector,
            answers: snapshot.answers,
            warnings: Vec::new(),
            blur_task: None,
        };
        Ok(Self::with_state(state, sync, api, probe, config))
    }

    fn with_state(
        state: SessionState,
        sync: SyncClient,
        api: Arc<dyn AttemptApi>,
        probe: Arc<dyn FocusProbe>,
        config: DetectorConfig,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            sync,
            api,
            probe,
            config,
        }
    }

    /// Creates the attempt on the server and attaches the detector.
    ///
    /// Violations stay inert until the first fullscreen entry moves the session to active.
    pub async fn start(&self, metadata: Option<AttemptMetadata>) -> Result<String, SessionError> {
        let mut state = self.state.lock().await;
        state.require(SessionPhase::NotStarted)?;
        if state.context.attempt_id.is_some() {
            return Err(SessionError::InvalidPhase(state.phase));
        }

        let request = StartAttemptRequest {
            user_id: state.context.user_id.clone(),
            assessment_id: state.context.assessment_id.clone(),
            metadata,
            ..Default::default()
        };
        let response = self.api.start_attempt(&request).await?;
        self.sync.load().await?;

        state.context.attempt_id = Some(response.attempt_id.clone());
        state.detector.attach();
        self.sync.start();

        tracing::info!(
            attempt_id = %response.attempt_id,
            user_id = %state.context.user_id,
            "Attempt started"
        );
        Ok(response.attempt_id)
    }

    pub async fn handle_signal(&self, signal: BrowserSignal) -> Result<SignalOutcome, SessionError> {
        let mut state = self.state.lock().await;
        let reaction = state.detector.handle(signal);

        let mut outcome = SignalOutcome {
            prevent_default: reaction.prevent_default,
            ..Default::default()
        };

        if state.phase == SessionPhase::NotStarted
            && state.context.attempt_id.is_some()
            && reaction
                .detections
                .iter()
                .any(|d| d.event_type == EventType::FullscreenEntered)
        {
            state.phase = SessionPhase::Active;
            tracing::info!("Fullscreen entered, attempt is active");
        }

        for detection in reaction.detections {
            outcome.logged.push(detection.event_type);
            if let Some(warning) = &detection.warning {
                outcome.warnings.push(warning.clone());
            }
            self.record(&mut state, detection).await?;
        }

        if let Some(check) = reaction.blur_check {
            self.schedule_blur_check(&mut state, check);
        }

        Ok(outcome)
    }

    fn schedule_blur_check(&self, state: &mut SessionState, check: BlurCheck) {
        state.cancel_blur_task();

        let controller = self.clone();
        let delay = self.config.blur_confirm_delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = controller.state.lock().await;
            let has_focus = controller.probe.has_focus();
            let Some(detection) = state.detector.confirm_blur(check, has_focus) else {
                return;
            };
            state.blur_task = None;
            if let Err(e) = controller.record(&mut state, detection).await {
                tracing::error!("Failed to queue blur violation: {}", e);
            }
        });
        state.blur_task = Some(task.abort_handle());
    }

    async fn record(&self, state: &mut SessionState, detection: Detection) -> Result<(), SyncError> {
        if let Some(warning) = detection.warning {
            tracing::warn!(
                event_type = %detection.event_type,
                violations = state.detector.violation_count(),
                "{}",
                warning.message
            );
            state.warnings.push(warning);
        }
        self.sync
            .log(&state.context, detection.event_type, detection.metadata)
            .await?;
        Ok(())
    }

    pub async fn view_question(&self, question_id: &str) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        state.require(SessionPhase::Active)?;
        state.context.current_question_id = Some(question_id.to_string());
        self.sync
            .log(&state.context, EventType::QuestionViewed, Map::new())
            .await?;
        Ok(())
    }

    pub async fn record_answer(&self, question_id: &str, answer: &str) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        state.require(SessionPhase::Active)?;
        state
            .answers
            .insert(question_id.to_string(), answer.to_string());

        let mut context = state.context.clone();
        context.current_question_id = Some(question_id.to_string());
        self.sync
            .log(&context, EventType::AnswerSelected, object(json!({ "answer": answer })))
            .await?;
        Ok(())
    }

    /// Shows the submit confirmation. Violations are suppressed until it is cancelled.
    pub async fn request_submit(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        state.require(SessionPhase::Active)?;
        state.phase = SessionPhase::Submitting;
        state.detector.set_submitting(true);
        state.cancel_blur_task();
        Ok(())
    }

    pub async fn cancel_submit(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        state.require(SessionPhase::Submitting)?;
        state.phase = SessionPhase::Active;
        state.detector.set_submitting(false);
        Ok(())
    }

    /// Delivers every queued event, then locks the attempt on the server.
    ///
    /// On failure the session returns to active and the caller may retry.
    pub async fn confirm_submit(&self) -> Result<SubmitOutcome, SessionError> {
        let mut state = self.state.lock().await;
        state.require(SessionPhase::Submitting)?;
        let attempt_id = state.context.attempt_id.clone().ok_or(SessionError::NoAttempt)?;

        self.sync.stop();
        if let Err(e) = self.sync.force_flush().await {
            tracing::warn!(attempt_id = %attempt_id, "Final sync failed, submit aborted: {}", e);
            self.revert_submit(&mut state);
            return Err(SessionError::FlushFailed(e));
        }

        let outcome = match self.api.submit_attempt(&attempt_id, &state.answers).await {
            Ok(attempt) => SubmitOutcome::Submitted(attempt),
            Err(SyncError::AlreadySubmitted) => {
                tracing::warn!(attempt_id = %attempt_id, "Attempt was already submitted");
                SubmitOutcome::AlreadySubmitted
            }
            Err(e) => {
                tracing::warn!(attempt_id = %attempt_id, "Submit failed: {}", e);
                self.revert_submit(&mut state);
                return Err(e.into());
            }
        };

        state.phase = SessionPhase::Submitted;
        state.detector.mark_submitted();
        state.cancel_blur_task();

        tracing::info!(
            attempt_id = %attempt_id,
            violations = state.detector.violation_count(),
            "Attempt submitted"
        );
        Ok(outcome)
    }

    fn revert_submit(&self, state: &mut SessionState) {
        state.phase = SessionPhase::Active;
        state.detector.set_submitting(false);
        self.sync.start();
    }

    /// Detaches the detector and stops the sync timer. Queued events stay persisted.
    pub async fn teardown(&self) {
        let mut state = self.state.lock().await;
        state.detector.detach();
        state.cancel_blur_task();
        self.sync.stop();
    }

    pub async fn phase(&self) -> SessionPhase {
        self.state.lock().await.phase
    }

    pub async fn context(&self) -> SessionContext {
        self.state.lock().await.context.clone()
    }

    pub async fn violation_count(&self) -> u64 {
        self.state.lock().await.detector.violation_count()
    }

    /// Returns and clears the warnings raised since the last call.
    pub async fn take_warnings(&self) -> Vec<Warning> {
        std::mem::take(&mut self.state.lock().await.warnings)
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().await;
        SessionSnapshot {
            context: state.context.clone(),
            phase: state.phase,
            has_ever_entered_fullscreen: state.detector.has_ever_entered_fullscreen(),
            violation_count: state.detector.violation_count(),
            answers: state.answers.clone(),
        }
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
