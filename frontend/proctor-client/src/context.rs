use serde::{Deserialize, Serialize};

/// Identity of the running attempt, stamped onto every logged event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub user_id: String,
    pub assessment_id: String,
    #[serde(default)]
    pub attempt_id: Option<String>,
    #[serde(default)]
    pub current_question_id: Option<String>,
}

impl SessionContext {
    pub fn new(user_id: impl Into<String>, assessment_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            assessment_id: assessment_id.into(),
            attempt_id: None,
            current_question_id: None,
        }
    }
}
