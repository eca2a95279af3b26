use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// One test-taking session of a subject for an assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub student_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    pub assessment_id: String,
    #[serde(default)]
    pub answers: BTreeMap<String, String>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub correct_answers: Option<u32>,
    #[serde(default)]
    pub total_questions: Option<u32>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
    pub violation_count: u64,
    pub submitted: bool,
    #[serde(default)]
    pub metadata: AttemptMetadata,
}

impl Attempt {
    pub fn new(req: StartAttemptRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: req.user_id,
            student_name: req.student_name,
            username: req.username,
            assessment_id: req.assessment_id,
            answers: BTreeMap::new(),
            score: None,
            correct_answers: None,
            total_questions: req.total_questions,
            start_time: now,
            end_time: None,
            status: AttemptStatus::Active,
            violation_count: 0,
            submitted: false,
            metadata: req.metadata.unwrap_or_default(),
        }
    }

    /// Applies the one-way submit transition.
    pub fn lock(&mut self, now: DateTime<Utc>, answers: Option<BTreeMap<String, String>>) {
        self.end_time = Some(now);
        self.status = AttemptStatus::Completed;
        self.submitted = true;
        if let Some(answers) = answers {
            self.answers = answers;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Active,
    Completed,
    Flagged,
    Abandoned,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::Active => "active",
            AttemptStatus::Completed => "completed",
            AttemptStatus::Flagged => "flagged",
            AttemptStatus::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_resolution: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StartAttemptRequest {
    #[serde(default)]
    #[validate(length(min = 1, message = "userId is required"))]
    pub user_id: String,
    #[serde(default)]
    #[validate(length(min = 1, message = "assessmentId is required"))]
    pub assessment_id: String,
    #[serde(default)]
    pub student_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub total_questions: Option<u32>,
    #[serde(default)]
    pub metadata: Option<AttemptMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAttemptRequest {
    #[serde(default)]
    pub answers: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAttemptResponse {
    pub success: bool,
    pub attempt_id: String,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AttemptResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    pub attempt: Attempt,
}

#[derive(Debug, Serialize)]
pub struct AttemptListResponse {
    pub success: bool,
    pub count: usize,
    pub attempts: Vec<Attempt>,
}
