//! Persisted session-trace format.
//!
//! Field names are camelCase on the wire and are read by external scoring
//! tools; keep them stable.

use chrono::{DateTime, Utc};
use llmnav_types::{ActionResult, RobotAction, RobotPose};
use serde::{Deserialize, Serialize};

/// What happened to the answer of one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IterationOutcome {
    /// The gateway gave up on a rate-limited request.
    RateLimited { error: String },
    /// The model did not answer within the response timeout.
    ResponseTimeout { error: String },
    /// The answer could not be parsed into an action.
    InvalidResponse { error: String },
    /// The safety gate rejected the action.
    DangerousAction,
    ActionCompleted { result: ActionResult },
    ActionFailed { result: ActionResult },
    ActionAborted { result: ActionResult },
    GoalCompleted,
}

/// One round-trip with the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationTrace {
    /// Prompt text sent to the model.
    pub message: String,
    pub response: Option<String>,
    pub action: Option<RobotAction>,
    pub outcome: Option<IterationOutcome>,
    /// Robot pose once the iteration settled, when the robot reports one.
    pub end_robot_status: Option<RobotPose>,
}

impl IterationTrace {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            response: None,
            action: None,
            outcome: None,
            end_robot_status: None,
        }
    }
}

/// Full record of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTrace {
    pub id: String,
    pub model: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub initial_robot_pose: Option<RobotPose>,
    pub iterations: Vec<IterationTrace>,
    pub goal_completed: bool,
    pub simulation_aborted: bool,
    pub abortion_reason: Option<String>,
    /// Answers that failed to parse.
    pub json_errors: usize,
    /// Actions rejected by the safety gate.
    pub safety_triggers: usize,
    pub number_of_iterations: usize,
}

impl SessionTrace {
    pub fn new(id: impl Into<String>, model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            prompt: prompt.into(),
            system_prompt: None,
            started_at: Utc::now(),
            finished_at: None,
            initial_robot_pose: None,
            iterations: Vec::new(),
            goal_completed: false,
            simulation_aborted: false,
            abortion_reason: None,
            json_errors: 0,
            safety_triggers: 0,
            number_of_iterations: 0,
        }
    }

    /// `true` once `END_OF_SIMULATION` has been recorded.
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn last_iteration_mut(&mut self) -> Option<&mut IterationTrace> {
        self.iterations.last_mut()
    }
}
