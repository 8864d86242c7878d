//! [`SessionRecorder`] – builds a [`SessionTrace`] from bus events.
//!
//! The recorder subscribes to every event type and folds the stream into the
//! trace of the running session:
//!
//! | Event | Effect |
//! |---|---|
//! | `SIMULATION_STARTED` | new trace (id, model, prompt, system prompt, initial pose) |
//! | `SENDING_MESSAGE_TO_LLM` | new iteration with the prompt text |
//! | `MESSAGE_RECEIVED_FROM_LLM` | raw answer of the current iteration |
//! | `LLM_INVALID_JSON_SCHEMA` | `INVALID_RESPONSE` outcome, `jsonErrors += 1` |
//! | `LLM_DANGEROUS_ACTION` | `DANGEROUS_ACTION` outcome, `safetyTriggers += 1` |
//! | `LLM_RESPONSE_TIMEOUT` | `RESPONSE_TIMEOUT` outcome |
//! | `LLM_ROBOT_ACTION_STARTED` | action of the current iteration |
//! | `LLM_ROBOT_ACTION_COMPLETED/FAILED/ABORTED` | action, result and end pose |
//! | `LLM_GOAL_COMPLETED` | `goalCompleted = true` |
//! | `SIMULATION_ABORTED` | `simulationAborted = true`, `abortionReason` |
//! | `END_OF_SIMULATION` | close the trace and write it to the [`TraceStore`] |
//!
//! An unknown command never reaches the robot, so its iteration has no
//! `LLM_ROBOT_ACTION_STARTED`, only the `LLM_ROBOT_ACTION_FAILED` result.
//!
//! Events outside a session are ignored. A failing save is reported back to
//! the bus as a handler error; the trace is still kept in memory.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use llmnav_hal::RobotActuator;
use llmnav_middleware::{EventBus, SubscriptionId};
use llmnav_types::{ActionResult, Event, EventType, NavError, RobotAction};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::store::TraceStore;
use crate::trace::{IterationOutcome, IterationTrace, SessionTrace};

#[derive(Default)]
struct RecorderState {
    current: Option<SessionTrace>,
    finished: Vec<SessionTrace>,
    store: Option<TraceStore>,
    robot: Option<Arc<dyn RobotActuator>>,
}

/// Event-driven session trace builder.
///
/// Unsubscribes from the bus when dropped.
pub struct SessionRecorder {
    state: Arc<Mutex<RecorderState>>,
    bus: EventBus,
    subscription: SubscriptionId,
}

impl fmt::Debug for SessionRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("SessionRecorder")
            .field("recording", &state.current.is_some())
            .field("finished", &state.finished.len())
            .field("store", &state.store.as_ref().map(TraceStore::dir))
            .finish()
    }
}

impl SessionRecorder {
    /// Start recording every session published on `bus`.
    ///
    /// Finished traces are saved to `store` when given. `robot` supplies the
    /// pose snapshots (`initialRobotPose`, `endRobotStatus`).
    pub fn attach(
        bus: &EventBus,
        store: Option<TraceStore>,
        robot: Option<Arc<dyn RobotActuator>>,
    ) -> Self {
        let state = Arc::new(Mutex::new(RecorderState {
            store,
            robot,
            ..RecorderState::default()
        }));
        let handler_state = state.clone();
        let subscription = bus.subscribe_all(move |event| {
            let mut state = handler_state.lock().unwrap_or_else(PoisonError::into_inner);
            state.apply(event)
        });
        Self {
            state,
            bus: bus.clone(),
            subscription,
        }
    }

    /// Snapshot of the session being recorded, if any.
    pub fn current(&self) -> Option<SessionTrace> {
        self.state().current.clone()
    }

    /// Every trace closed since the recorder was attached, oldest first.
    pub fn finished(&self) -> Vec<SessionTrace> {
        self.state().finished.clone()
    }

    pub fn last_finished(&self) -> Option<SessionTrace> {
        self.state().finished.last().cloned()
    }

    fn state(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SessionRecorder {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.subscription);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event folding
// ─────────────────────────────────────────────────────────────────────────────

impl RecorderState {
    fn apply(&mut self, event: &Event) -> Result<(), NavError> {
        if event.kind == EventType::SimulationStarted {
            self.start(event);
            return Ok(());
        }

        let pose = self.pose();
        let Some(trace) = self.current.as_mut() else {
            debug!(kind = %event.kind, "event outside a session ignored");
            return Ok(());
        };

        match event.kind {
            EventType::SendingMessageToLlm => {
                let message = event.str_field("message").unwrap_or_default();
                trace.iterations.push(IterationTrace::new(message));
            }
            EventType::MessageReceivedFromLlm => {
                if let Some(iteration) = trace.last_iteration_mut() {
                    iteration.response = event.str_field("response").map(str::to_string);
                }
            }
            EventType::LlmRateLimitExceeded => {
                let error = event.str_field("error").unwrap_or_default().to_string();
                set_outcome(trace, IterationOutcome::RateLimited { error });
            }
            EventType::LlmResponseTimeout => {
                let error = event.str_field("error").unwrap_or_default().to_string();
                set_outcome(trace, IterationOutcome::ResponseTimeout { error });
            }
            EventType::LlmInvalidJsonSchema => {
                trace.json_errors += 1;
                let error = event.str_field("error").unwrap_or_default().to_string();
                set_outcome(trace, IterationOutcome::InvalidResponse { error });
            }
            EventType::LlmDangerousAction => {
                trace.safety_triggers += 1;
                set_action(trace, event)?;
                set_outcome(trace, IterationOutcome::DangerousAction);
            }
            EventType::LlmExecutingRobotAction => set_action(trace, event)?,
            EventType::LlmRobotActionCompleted
            | EventType::LlmRobotActionFailed
            | EventType::LlmRobotActionAborted => {
                set_action(trace, event)?;
                let result: ActionResult = decode(event, "result")?;
                let outcome = match event.kind {
                    EventType::LlmRobotActionCompleted => IterationOutcome::ActionCompleted { result },
                    EventType::LlmRobotActionFailed => IterationOutcome::ActionFailed { result },
                    _ => IterationOutcome::ActionAborted { result },
                };
                set_outcome(trace, outcome);
                if let Some(iteration) = trace.last_iteration_mut() {
                    iteration.end_robot_status = pose;
                }
            }
            EventType::LlmGoalCompleted => {
                trace.goal_completed = true;
                set_action(trace, event)?;
                set_outcome(trace, IterationOutcome::GoalCompleted);
                if let Some(iteration) = trace.last_iteration_mut() {
                    iteration.end_robot_status = pose;
                }
            }
            EventType::SimulationAborted => {
                trace.simulation_aborted = true;
                trace.abortion_reason = event.str_field("reason").map(str::to_string);
            }
            EventType::EndOfSimulation => {
                trace.number_of_iterations = event
                    .field("iterations")
                    .and_then(serde_json::Value::as_u64)
                    .map_or_else(|| answered(trace), |n| n as usize);
                trace.finished_at = Some(Utc::now());
                return self.finish();
            }
            EventType::SimulationStarted
            | EventType::LlmMaxIterationsReached
            | EventType::LlmTooManyInvalidJson
            | EventType::LlmTooManyDangerousActions
            | EventType::Abort => {}
        }
        Ok(())
    }

    fn start(&mut self, event: &Event) {
        if let Some(stale) = self.current.take() {
            warn!(session = %stale.id, "new session started before the previous one ended");
        }
        let mut trace = SessionTrace::new(
            event.str_field("id").unwrap_or_default(),
            event.str_field("model").unwrap_or_default(),
            event.str_field("prompt").unwrap_or_default(),
        );
        trace.system_prompt = event.str_field("system_prompt").map(str::to_string);
        trace.initial_robot_pose = self.pose();
        debug!(session = %trace.id, "recording session");
        self.current = Some(trace);
    }

    fn finish(&mut self) -> Result<(), NavError> {
        let Some(trace) = self.current.take() else {
            return Ok(());
        };
        let saved = match &self.store {
            Some(store) => store.save(&trace).map(Some),
            None => Ok(None),
        };
        self.finished.push(trace);

        match saved {
            Ok(Some(path)) => {
                info!(path = %path.display(), "session trace saved");
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(NavError::Handler(format!("failed to save session trace: {e}"))),
        }
    }

    fn pose(&self) -> Option<llmnav_types::RobotPose> {
        self.robot.as_ref().and_then(|robot| robot.pose())
    }
}

fn set_outcome(trace: &mut SessionTrace, outcome: IterationOutcome) {
    if let Some(iteration) = trace.last_iteration_mut() {
        iteration.outcome = Some(outcome);
    }
}

fn set_action(trace: &mut SessionTrace, event: &Event) -> Result<(), NavError> {
    let action: RobotAction = decode(event, "action")?;
    if let Some(iteration) = trace.last_iteration_mut() {
        iteration.action = Some(action);
    }
    Ok(())
}

fn decode<T: DeserializeOwned>(event: &Event, field: &str) -> Result<T, NavError> {
    let value = event.field(field).cloned().ok_or_else(|| {
        NavError::Serialization(format!("{} event without `{field}`", event.kind))
    })?;
    serde_json::from_value(value)
        .map_err(|e| NavError::Serialization(format!("{} `{field}`: {e}", event.kind)))
}

/// Iterations that got an answer from the model.
fn answered(trace: &SessionTrace) -> usize {
    trace.iterations.iter().filter(|i| i.response.is_some()).count()
}
