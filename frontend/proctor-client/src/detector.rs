use std::time::Duration;

use proctor_api::models::EventType;
use serde::Serialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// How long a blur must persist before it counts as a violation.
    pub blur_confirm_delay: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            blur_confirm_delay: Duration::from_millis(100),
        }
    }
}

/// Raw browser signals, as delivered by the host page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserSignal {
    VisibilityChanged { hidden: bool },
    WindowBlur,
    WindowFocus,
    /// `present` is whether a fullscreen element exists after the change.
    FullscreenChanged { present: bool },
    Copy,
    Cut,
    Paste,
    ContextMenu,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    pub event_type: EventType,
    pub message: &'static str,
}

impl Warning {
    fn for_violation(event_type: EventType) -> Option<Self> {
        let message = match event_type {
            EventType::TabSwitch => "You switched tabs!",
            EventType::WindowBlur => "Test window lost focus!",
            EventType::FullscreenExit => "You exited fullscreen mode!",
            EventType::CopyAttempt => "Copying is disabled!",
            EventType::PasteAttempt => "Pasting is disabled!",
            EventType::ContextMenu => "The context menu is disabled!",
            _ => return None,
        };
        Some(Self {
            event_type,
            message,
        })
    }
}

/// A classified event ready to be logged.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub event_type: EventType,
    pub metadata: Map<String, Value>,
    pub warning: Option<Warning>,
}

impl Detection {
    fn new(event_type: EventType, metadata: Value) -> Self {
        let metadata = match metadata {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            event_type,
            metadata,
            warning: Warning::for_violation(event_type),
        }
    }

    pub fn is_violation(&self) -> bool {
        self.event_type.is_violation()
    }
}

/// Token for a scheduled blur re-check. Stale tokens are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlurCheck {
    generation: u64,
}

#[derive(Debug, Default, PartialEq)]
pub struct Reaction {
    pub detections: Vec<Detection>,
    /// The host must cancel the browser's default action.
    pub prevent_default: bool,
    /// The host must call [`ViolationDetector::confirm_blur`] after the configured delay.
    pub blur_check: Option<BlurCheck>,
}

/// Classifies browser signals into domain events.
///
/// Every transition reads the detector's own fields, so the host never has to mirror state
/// into callbacks. Violations are only produced while attached, unsubmitted, after the first
/// fullscreen entry and outside of the submit confirmation.
#[derive(Debug, Default)]
pub struct ViolationDetector {
    attached: bool,
    submitted: bool,
    submitting: bool,
    has_ever_entered_fullscreen: bool,
    focused: bool,
    fullscreen: bool,
    violation_count: u64,
    blur_generation: u64,
    pending_blur: Option<u64>,
}

impl ViolationDetector {
    pub fn new() -> Self {
        Self {
            focused: true,
            ..Default::default()
        }
    }

    /// Rebuilds a detector for a reloaded page.
    pub fn restore(has_ever_entered_fullscreen: bool, violation_count: u64) -> Self {
        Self {
            has_ever_entered_fullscreen,
            violation_count,
            ..Self::new()
        }
    }

    pub fn attach(&mut self) {
        if !self.submitted {
            self.attached = true;
        }
    }

    /// Stops classification and invalidates any pending blur check.
    pub fn detach(&mut self) {
        self.attached = false;
        self.cancel_blur_check();
    }

    pub fn set_submitting(&mut self, submitting: bool) {
        self.submitting = submitting;
        if submitting {
            self.cancel_blur_check();
        }
    }

    pub fn mark_submitted(&mut self) {
        self.submitted = true;
        self.submitting = false;
        self.detach();
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn has_ever_entered_fullscreen(&self) -> bool {
        self.has_ever_entered_fullscreen
    }

    pub fn is_fullscreen(&self) -> bool {
        self.fullscreen
    }

    pub fn is_focused(&self) -> bool {
        self.focused
    }

    pub fn violation_count(&self) -> u64 {
        self.violation_count
    }

    fn is_live(&self) -> bool {
        self.attached && !self.submitted
    }

    fn is_gated(&self) -> bool {
        self.is_live() && self.has_ever_entered_fullscreen && !self.submitting
    }

    fn cancel_blur_check(&mut self) {
        self.pending_blur = None;
        self.blur_generation += 1;
    }

    fn violation(&mut self, event_type: EventType, metadata: Value) -> Detection {
        self.violation_count += 1;
        Detection::new(event_type, metadata)
    }

    pub fn handle(&mut self, signal: BrowserSignal) -> Reaction {
        let mut reaction = Reaction::default();
        if !self.is_live() {
            return reaction;
        }

        match signal {
            BrowserSignal::VisibilityChanged { hidden } => {
                if !self.is_gated() {
                    return reaction;
                }
                let detection = if hidden {
                    self.violation(EventType::TabSwitch, json!({ "hidden": true }))
                } else {
                    Detection::new(EventType::FocusRestored, json!({ "hidden": false }))
                };
                reaction.detections.push(detection);
            }
            BrowserSignal::WindowBlur => {
                if self.is_gated() {
                    self.blur_generation += 1;
                    self.pending_blur = Some(self.blur_generation);
                    reaction.blur_check = Some(BlurCheck {
                        generation: self.blur_generation,
                    });
                }
            }
            BrowserSignal::WindowFocus => {
                self.focused = true;
                if self.has_ever_entered_fullscreen {
                    reaction.detections.push(Detection::new(
                        EventType::FocusRestored,
                        json!({ "type": "focus" }),
                    ));
                }
            }
            BrowserSignal::FullscreenChanged { present } => {
                let was_fullscreen = self.fullscreen;
                self.fullscreen = present;
                if present && !was_fullscreen {
                    self.has_ever_entered_fullscreen = true;
                    reaction.detections.push(Detection::new(
                        EventType::FullscreenEntered,
                        json!({}),
                    ));
                } else if !present && was_fullscreen && self.has_ever_entered_fullscreen {
                    // counted even during the submit confirmation
                    reaction.detections.push(self.violation(
                        EventType::FullscreenExit,
                        json!({ "type": "fullscreen_exit" }),
                    ));
                }
            }
            BrowserSignal::Copy | BrowserSignal::Cut | BrowserSignal::Paste => {
                reaction.prevent_default = true;
                if self.is_gated() {
                    let (event_type, action) = match signal {
                        BrowserSignal::Paste => (EventType::PasteAttempt, "paste"),
                        BrowserSignal::Cut => (EventType::CopyAttempt, "cut"),
                        _ => (EventType::CopyAttempt, "copy"),
                    };
                    reaction
                        .detections
                        .push(self.violation(event_type, json!({ "action": action })));
                }
            }
            BrowserSignal::ContextMenu => {
                reaction.prevent_default = true;
                if self.is_gated() {
                    reaction.detections.push(
                        self.violation(EventType::ContextMenu, json!({ "action": "contextmenu" })),
                    );
                }
            }
        }

        reaction
    }

    /// Completes a scheduled blur check with the window's focus state at that moment.
    pub fn confirm_blur(&mut self, check: BlurCheck, has_focus: bool) -> Option<Detection> {
        if self.pending_blur != Some(check.generation) {
            return None;
        }
        self.pending_blur = None;

        if has_focus || !self.is_gated() {
            return None;
        }
        self.focused = false;
        Some(self.violation(EventType::WindowBlur, json!({ "type": "blur" })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_detector() -> ViolationDetector {
        let mut detector = ViolationDetector::new();
        detector.attach();
        detector.handle(BrowserSignal::FullscreenChanged { present: true });
        detector
    }

    fn types(reaction: &Reaction) -> Vec<EventType> {
        reaction.detections.iter().map(|d| d.event_type).collect()
    }

    #[test]
    fn nothing_is_classified_before_attach() {
        let mut detector = ViolationDetector::new();
        let reaction = detector.handle(BrowserSignal::VisibilityChanged { hidden: true });
        assert!(reaction.detections.is_empty());
        assert!(!reaction.prevent_default);
        assert_eq!(detector.violation_count(), 0);
    }

    #[test]
    fn fullscreen_exit_before_entry_is_ignored() {
        let mut detector = ViolationDetector::new();
        detector.attach();

        for present in [false, false] {
            let reaction = detector.handle(BrowserSignal::FullscreenChanged { present });
            assert!(reaction.detections.is_empty());
        }
        let reaction = detector.handle(BrowserSignal::VisibilityChanged { hidden: true });
        assert!(reaction.detections.is_empty());
        assert_eq!(detector.violation_count(), 0);
    }

    #[test]
    fn fullscreen_entry_is_sticky() {
        let mut detector = active_detector();
        assert!(detector.has_ever_entered_fullscreen());

        let reaction = detector.handle(BrowserSignal::FullscreenChanged { present: false });
        assert_eq!(types(&reaction), vec![EventType::FullscreenExit]);
        assert_eq!(
            reaction.detections[0].warning.as_ref().map(|w| w.message),
            Some("You exited fullscreen mode!")
        );
        assert!(detector.has_ever_entered_fullscreen());

        let reaction = detector.handle(BrowserSignal::FullscreenChanged { present: true });
        assert_eq!(types(&reaction), vec![EventType::FullscreenEntered]);
        assert_eq!(detector.violation_count(), 1);
    }

    #[test]
    fn tab_switch_and_return() {
        let mut detector = active_detector();

        let hidden = detector.handle(BrowserSignal::VisibilityChanged { hidden: true });
        assert_eq!(types(&hidden), vec![EventType::TabSwitch]);
        assert_eq!(hidden.detections[0].metadata["hidden"], true);
        assert!(hidden.detections[0].warning.is_some());

        let visible = detector.handle(BrowserSignal::VisibilityChanged { hidden: false });
        assert_eq!(types(&visible), vec![EventType::FocusRestored]);
        assert!(visible.detections[0].warning.is_none());
        assert_eq!(detector.violation_count(), 1);
    }

    #[test]
    fn submitting_suppresses_violations() {
        let mut detector = active_detector();
        detector.set_submitting(true);

        assert!(detector
            .handle(BrowserSignal::VisibilityChanged { hidden: true })
            .detections
            .is_empty());
        assert!(detector.handle(BrowserSignal::WindowBlur).blur_check.is_none());
        let paste = detector.handle(BrowserSignal::Paste);
        assert!(paste.prevent_default);
        assert!(paste.detections.is_empty());
        assert_eq!(detector.violation_count(), 0);

        detector.set_submitting(false);
        let paste = detector.handle(BrowserSignal::Paste);
        assert_eq!(types(&paste), vec![EventType::PasteAttempt]);
    }

    #[test]
    fn blur_counts_only_when_focus_stays_lost() {
        let mut detector = active_detector();

        let check = detector.handle(BrowserSignal::WindowBlur).blur_check.unwrap();
        assert!(detector.confirm_blur(check, true).is_none());
        assert_eq!(detector.violation_count(), 0);

        let check = detector.handle(BrowserSignal::WindowBlur).blur_check.unwrap();
        let detection = detector.confirm_blur(check, false).unwrap();
        assert_eq!(detection.event_type, EventType::WindowBlur);
        assert_eq!(detection.metadata["type"], "blur");
        assert!(!detector.is_focused());
        assert_eq!(detector.violation_count(), 1);

        // a completed check cannot fire twice
        assert!(detector.confirm_blur(check, false).is_none());
    }

    #[test]
    fn blur_check_is_invalidated_by_newer_blur_and_detach() {
        let mut detector = active_detector();

        let stale = detector.handle(BrowserSignal::WindowBlur).blur_check.unwrap();
        let fresh = detector.handle(BrowserSignal::WindowBlur).blur_check.unwrap();
        assert!(detector.confirm_blur(stale, false).is_none());
        assert!(detector.confirm_blur(fresh, false).is_some());

        let pending = detector.handle(BrowserSignal::WindowBlur).blur_check.unwrap();
        detector.detach();
        assert!(detector.confirm_blur(pending, false).is_none());
        assert_eq!(detector.violation_count(), 1);
    }

    #[test]
    fn blur_check_cancelled_by_submit_confirmation() {
        let mut detector = active_detector();
        let check = detector.handle(BrowserSignal::WindowBlur).blur_check.unwrap();
        detector.set_submitting(true);
        assert!(detector.confirm_blur(check, false).is_none());
    }

    #[test]
    fn focus_restored_only_after_fullscreen_entry() {
        let mut detector = ViolationDetector::new();
        detector.attach();
        assert!(detector
            .handle(BrowserSignal::WindowFocus)
            .detections
            .is_empty());

        detector.handle(BrowserSignal::FullscreenChanged { present: true });
        let reaction = detector.handle(BrowserSignal::WindowFocus);
        assert_eq!(types(&reaction), vec![EventType::FocusRestored]);
        assert_eq!(reaction.detections[0].metadata["type"], "focus");
        assert!(detector.is_focused());
    }

    #[test]
    fn clipboard_actions_are_always_prevented() {
        let mut detector = ViolationDetector::new();
        detector.attach();
        for signal in [
            BrowserSignal::Copy,
            BrowserSignal::Cut,
            BrowserSignal::Paste,
            BrowserSignal::ContextMenu,
        ] {
            let reaction = detector.handle(signal);
            assert!(reaction.prevent_default);
            assert!(reaction.detections.is_empty());
        }

        detector.handle(BrowserSignal::FullscreenChanged { present: true });
        let cut = detector.handle(BrowserSignal::Cut);
        assert_eq!(types(&cut), vec![EventType::CopyAttempt]);
        assert_eq!(cut.detections[0].metadata["action"], "cut");
        let menu = detector.handle(BrowserSignal::ContextMenu);
        assert_eq!(types(&menu), vec![EventType::ContextMenu]);
        assert_eq!(detector.violation_count(), 2);
    }

    #[test]
    fn submitted_detector_is_inert() {
        let mut detector = active_detector();
        detector.mark_submitted();
        detector.attach();

        assert!(!detector.is_attached());
        let reaction = detector.handle(BrowserSignal::FullscreenChanged { present: false });
        assert_eq!(reaction, Reaction::default());
        assert!(!detector.handle(BrowserSignal::Copy).prevent_default);
    }

    #[test]
    fn restored_detector_keeps_sticky_flag() {
        let mut detector = ViolationDetector::restore(true, 4);
        detector.attach();
        let reaction = detector.handle(BrowserSignal::VisibilityChanged { hidden: true });
        assert_eq!(types(&reaction), vec![EventType::TabSwitch]);
        assert_eq!(detector.violation_count(), 5);
    }
}
