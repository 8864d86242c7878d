use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Motion command the model may choose.
///
/// The wire form is the upper-case name (`"FRONT"`, `"ROTATE_LEFT"`, ...),
/// matched exactly. Strings outside the known set, including other casings,
/// are kept as [`Command::Unknown`] so they
/// survive parsing and are rejected by the executor's dispatch instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Command {
    Front,
    Back,
    RotateLeft,
    RotateRight,
    Complete,
    Unknown(String),
}

impl Command {
    /// Every command with a defined meaning, in prompt order.
    pub const KNOWN: [Command; 5] = [
        Command::Front,
        Command::Back,
        Command::RotateLeft,
        Command::RotateRight,
        Command::Complete,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Command::Front => "FRONT",
            Command::Back => "BACK",
            Command::RotateLeft => "ROTATE_LEFT",
            Command::RotateRight => "ROTATE_RIGHT",
            Command::Complete => "COMPLETE",
            Command::Unknown(raw) => raw,
        }
    }

    /// `true` for the four motion primitives.
    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            Command::Front | Command::Back | Command::RotateLeft | Command::RotateRight
        )
    }
}

impl From<String> for Command {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "FRONT" => Command::Front,
            "BACK" => Command::Back,
            "ROTATE_LEFT" => Command::RotateLeft,
            "ROTATE_RIGHT" => Command::RotateRight,
            "COMPLETE" => Command::Complete,
            _ => Command::Unknown(raw),
        }
    }
}

impl From<&str> for Command {
    fn from(raw: &str) -> Self {
        Command::from(raw.to_string())
    }
}

impl From<Command> for String {
    fn from(command: Command) -> Self {
        command.as_str().to_string()
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-text rationale the model attaches to an action. Logged, never used
/// for control decisions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Motivation {
    pub subgoal: String,
    pub reasoning: String,
    pub scene_description: String,
}

/// A single action chosen by the model.
///
/// `parameter` is a distance in meters for `FRONT`/`BACK` and an angle in
/// degrees for the rotations. It is ignored for `COMPLETE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotAction {
    pub command: Command,
    pub parameter: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motivation: Option<Motivation>,
}

impl RobotAction {
    pub fn new(command: impl Into<Command>, parameter: f64) -> Self {
        Self {
            command: command.into(),
            parameter,
            motivation: None,
        }
    }

    pub fn with_motivation(mut self, motivation: Motivation) -> Self {
        self.motivation = Some(motivation);
        self
    }
}

/// Which stage of response parsing rejected the model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParseErrorKind {
    /// No JSON could be extracted from the text.
    InvalidJson,
    /// JSON was found but does not match the response schema.
    SchemaViolation,
    /// The JSON matched the schema but could not be turned into a [`RobotAction`].
    ConstructionError,
}

impl std::fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseErrorKind::InvalidJson => f.write_str("invalid JSON"),
            ParseErrorKind::SchemaViolation => f.write_str("schema violation"),
            ParseErrorKind::ConstructionError => f.write_str("construction error"),
        }
    }
}

/// A typed parse failure. Never carries a partially built action.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind}: {detail}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub detail: String,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Outcome of one model turn: an action, or the reason it was rejected.
pub type ParseResult = Result<RobotAction, ParseError>;

/// Disposition of an attempted actuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Success,
    Failure,
    ObstacleDetected,
    /// The worker did not finish within the action timeout and was abandoned.
    Aborted,
}

/// Structured result reported by the action executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub status: ActionStatus,
    pub message: String,
}

impl ActionResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Success,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Failure,
            message: message.into(),
        }
    }

    pub fn obstacle(message: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::ObstacleDetected,
            message: message.into(),
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Aborted,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }
}

/// Planar robot pose in the simulator's world frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RobotPose {
    pub x: f64,
    pub y: f64,
    /// Heading in radians, counter-clockwise from the +x axis.
    pub heading: f64,
}

/// Lifecycle events published by the control loop.
///
/// The serialized names are part of the persisted session-trace format and
/// must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "simulation_start")]
    SimulationStarted,
    #[serde(rename = "abort")]
    SimulationAborted,
    #[serde(rename = "simulation_end")]
    EndOfSimulation,
    #[serde(rename = "message_sent_to_llm")]
    SendingMessageToLlm,
    #[serde(rename = "message_received_from_llm")]
    MessageReceivedFromLlm,
    #[serde(rename = "llm_rate_limit_exceeded")]
    LlmRateLimitExceeded,
    #[serde(rename = "llm_response_timeout")]
    LlmResponseTimeout,
    #[serde(rename = "llm_invalid_json_schema")]
    LlmInvalidJsonSchema,
    #[serde(rename = "llm_robot_action_started")]
    LlmExecutingRobotAction,
    #[serde(rename = "llm_robot_action_failed")]
    LlmRobotActionFailed,
    #[serde(rename = "llm_robot_action_completed")]
    LlmRobotActionCompleted,
    #[serde(rename = "llm_robot_action_aborted")]
    LlmRobotActionAborted,
    #[serde(rename = "llm_dangerous_action")]
    LlmDangerousAction,
    #[serde(rename = "llm_max_iterations_reached")]
    LlmMaxIterationsReached,
    #[serde(rename = "llm_too_many_invalid_json")]
    LlmTooManyInvalidJson,
    #[serde(rename = "llm_too_many_dangerous_actions")]
    LlmTooManyDangerousActions,
    #[serde(rename = "llm_goal_completed")]
    LlmGoalCompleted,
    /// External cancellation request. Observed by the control loop between
    /// iterations.
    #[serde(rename = "abort_requested")]
    Abort,
}

impl EventType {
    /// Stable wire name, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SimulationStarted => "simulation_start",
            EventType::SimulationAborted => "abort",
            EventType::EndOfSimulation => "simulation_end",
            EventType::SendingMessageToLlm => "message_sent_to_llm",
            EventType::MessageReceivedFromLlm => "message_received_from_llm",
            EventType::LlmRateLimitExceeded => "llm_rate_limit_exceeded",
            EventType::LlmResponseTimeout => "llm_response_timeout",
            EventType::LlmInvalidJsonSchema => "llm_invalid_json_schema",
            EventType::LlmExecutingRobotAction => "llm_robot_action_started",
            EventType::LlmRobotActionFailed => "llm_robot_action_failed",
            EventType::LlmRobotActionCompleted => "llm_robot_action_completed",
            EventType::LlmRobotActionAborted => "llm_robot_action_aborted",
            EventType::LlmDangerousAction => "llm_dangerous_action",
            EventType::LlmMaxIterationsReached => "llm_max_iterations_reached",
            EventType::LlmTooManyInvalidJson => "llm_too_many_invalid_json",
            EventType::LlmTooManyDangerousActions => "llm_too_many_dangerous_actions",
            EventType::LlmGoalCompleted => "llm_goal_completed",
            EventType::Abort => "abort_requested",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope delivered to event-bus subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "llmnav-runtime::controller"
    pub source: String,
    pub kind: EventType,
    /// Small JSON object whose fields depend on `kind`.
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(source: impl Into<String>, kind: EventType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            kind,
            payload,
        }
    }

    /// Look up a top-level payload field.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.payload.get(name)
    }

    /// Look up a top-level payload field as a string slice.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(serde_json::Value::as_str)
    }
}

/// Global error type spanning hardware failures, model errors and bus faults.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum NavError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Hardware Fault on {component}: {details}")]
    HardwareFault { component: String, details: String },

    #[error("Obstacle detected {distance:.2} m ahead")]
    ObstacleDetected { distance: f64 },

    #[error("LLM request failed: {0}")]
    LlmRequestFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Event handler failed: {0}")]
    Handler(String),
}
