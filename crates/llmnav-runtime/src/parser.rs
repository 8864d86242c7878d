//! Response parser and schema validator.
//!
//! Turns raw model text into a [`RobotAction`] in three independently
//! failing steps:
//!
//! 1. **Extract** – take the body of a ```` ```json ```` fenced block, or the
//!    whole text when there is no such fence, and parse it as JSON
//!    ([`ParseErrorKind::InvalidJson`]).
//! 2. **Validate** – deserialize into [`ActionResponse`]
//!    ([`ParseErrorKind::SchemaViolation`]).
//! 3. **Construct** – coerce `parameters` to a finite, non-negative `f64`
//!    and build the action ([`ParseErrorKind::ConstructionError`]).
//!
//! [`parse`] never panics on any input and never returns a partial action.
//!
//! # Example
//!
//! ```rust
//! use llmnav_runtime::parser::parse;
//! use llmnav_types::Command;
//!
//! let raw = "Sure!\n```json\n{\"goal\":\"reach the crate\",\"scene_description\":\"a crate ahead\",\
//!            \"action\":{\"command\":\"FRONT\",\"parameters\":0.5}}\n```";
//! let action = parse(raw).expect("valid response");
//! assert_eq!(action.command, Command::Front);
//! assert_eq!(action.parameter, 0.5);
//! ```

use llmnav_types::{Command, Motivation, ParseError, ParseErrorKind, ParseResult, RobotAction};
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Response schema
// ─────────────────────────────────────────────────────────────────────────────

/// The JSON object the model must answer with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ActionResponse {
    /// The sub-goal the model is pursuing with this action.
    pub goal: String,
    /// What the model sees in the current camera frame.
    pub scene_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub action: ActionEnvelope,
}

/// The action part of an [`ActionResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ActionEnvelope {
    /// One of `FRONT`, `BACK`, `ROTATE_LEFT`, `ROTATE_RIGHT`, `COMPLETE`.
    pub command: String,
    /// Meters for `FRONT`/`BACK`, degrees for the rotations.
    pub parameters: Number,
}

impl ActionResponse {
    /// Render an action back into the response shape, e.g. for few-shot
    /// examples.
    pub fn from_action(action: &RobotAction) -> Self {
        let motivation = action.motivation.clone().unwrap_or_default();
        Self {
            goal: motivation.subgoal,
            scene_description: motivation.scene_description,
            reasoning: Some(motivation.reasoning).filter(|r| !r.is_empty()),
            action: ActionEnvelope {
                command: action.command.to_string(),
                parameters: Number::from_f64(action.parameter).unwrap_or_else(|| Number::from(0)),
            },
        }
    }

    /// Build the typed action.
    pub fn into_action(self) -> ParseResult {
        let parameter = self
            .action
            .parameters
            .as_f64()
            .filter(|p| p.is_finite())
            .ok_or_else(|| {
                ParseError::new(
                    ParseErrorKind::ConstructionError,
                    format!("parameters `{}` is not a finite number", self.action.parameters),
                )
            })?;

        let command = Command::from(self.action.command);
        if command.is_motion() && parameter < 0.0 {
            return Err(ParseError::new(
                ParseErrorKind::ConstructionError,
                format!("parameters for {command} must be non-negative, got {parameter}"),
            ));
        }

        Ok(RobotAction::new(command, parameter).with_motivation(Motivation {
            subgoal: self.goal,
            reasoning: self.reasoning.unwrap_or_default(),
            scene_description: self.scene_description,
        }))
    }
}

/// JSON Schema of [`ActionResponse`], included in corrective prompts.
pub fn response_schema() -> Value {
    serde_json::to_value(schema_for!(ActionResponse)).unwrap_or(Value::Null)
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Body of the first ```` ```json ```` fenced block in `text`, trimmed.
///
/// An opening fence is a triple backtick followed by the tag `json`
/// (any case) and a line break; the body runs to the next triple backtick.
/// Stray backticks and fences with any other tag are skipped. Returns
/// `None` when no closed `json` fence exists.
pub fn extract_fenced_json(text: &str) -> Option<&str> {
    let mut from = 0;
    while let Some(found) = text[from..].find("```") {
        let after = &text[from + found + 3..];
        from += found + 3;
        let Some(line_end) = after.find('\n') else {
            break;
        };
        if !after[..line_end].trim().eq_ignore_ascii_case("json") {
            continue;
        }
        let body = &after[line_end + 1..];
        return body.find("```").map(|close| body[..close].trim());
    }
    None
}

/// Parse raw model output into a [`RobotAction`].
pub fn parse(raw: &str) -> ParseResult {
    let candidate = extract_fenced_json(raw).unwrap_or_else(|| raw.trim());

    let value: Value = serde_json::from_str(candidate)
        .map_err(|e| ParseError::new(ParseErrorKind::InvalidJson, e.to_string()))?;
    if !value.is_object() {
        return Err(ParseError::new(
            ParseErrorKind::SchemaViolation,
            "expected a JSON object at the top level",
        ));
    }

    let response: ActionResponse = serde_json::from_value(value)
        .map_err(|e| ParseError::new(ParseErrorKind::SchemaViolation, e.to_string()))?;

    response.into_action()
}
