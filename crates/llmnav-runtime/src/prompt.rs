//! Prompt text sent to the model.

use llmnav_types::{ActionResult, ParseError, RobotAction};

use crate::parser::response_schema;

/// Default system instruction for navigation sessions.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "\
You control a small differential-drive robot in an indoor arena. Each message \
gives you the user's goal or feedback, a digest of the forward LIDAR and, when \
available, the current camera frame.

Answer with exactly one JSON object, optionally inside a ```json fenced block:
{\"goal\": string, \"scene_description\": string, \"reasoning\": string, \
\"action\": {\"command\": string, \"parameters\": number}}

Commands:
- FRONT: drive forward `parameters` meters.
- BACK: drive backward `parameters` meters.
- ROTATE_LEFT: turn counter-clockwise `parameters` degrees.
- ROTATE_RIGHT: turn clockwise `parameters` degrees.
- COMPLETE: the goal has been reached; `parameters` is ignored.

Rules:
- Issue one action per answer and wait for feedback before the next one.
- Never drive forward further than the free distance reported by the LIDAR.
- Prefer short moves when the target is close or the view is uncertain.";

/// Lead text for every prompt after a successful action.
pub const CURRENT_VIEW: &str = "Current view:";

/// Re-prompt after an unparsable or invalid response.
pub fn correction_message(error: &ParseError) -> String {
    let schema = serde_json::to_string_pretty(&response_schema()).unwrap_or_default();
    format!(
        "Your last answer could not be used ({error}). Reply with a single JSON object \
         that matches this JSON Schema:\n{schema}"
    )
}

/// Re-prompt after an action was rejected by the safety gate.
pub fn dangerous_action_message(action: &RobotAction) -> String {
    format!(
        "The given action: {} with parameter {} is considered dangerous as it may lead \
         to a collision. Please provide a different action that is safe to execute.",
        action.command, action.parameter
    )
}

/// Lead text after a successfully executed action.
pub fn action_feedback(action: &RobotAction, result: &ActionResult) -> String {
    format!(
        "Action {} {} finished: {}.\n{CURRENT_VIEW}",
        action.command, action.parameter, result.message
    )
}

/// Join the lead text and the scene digest into one user turn.
pub fn compose(lead: &str, scene: &str) -> String {
    format!("{lead}\n\n{scene}")
}
