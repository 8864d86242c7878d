//! [`LlmRobotController`] – the session orchestrator.
//!
//! One call to [`LlmRobotController::ask`] is one *session*: the robot is
//! driven by the model until it answers `COMPLETE`, the iteration budget is
//! spent, an action fails, or an `ABORT` event arrives. Each iteration:
//!
//! 1. **Observe** – read the forward LIDAR, build the scene digest and
//!    (optionally) grab a camera frame.
//! 2. **Ask** – send the prompt through the [`ChatGateway`], bracketed by
//!    `SENDING_MESSAGE_TO_LLM` / `MESSAGE_RECEIVED_FROM_LLM`. A call that
//!    outlives the gateway's response timeout emits `LLM_RESPONSE_TIMEOUT`
//!    and ends the session.
//! 3. **Parse** – an invalid answer emits `LLM_INVALID_JSON_SCHEMA` and the
//!    next prompt is a correction naming the schema and the error.
//! 4. **Gate** – a fresh LIDAR sweep is checked by the executor's safety
//!    rules; an unsafe action emits `LLM_DANGEROUS_ACTION` and is answered
//!    with a collision warning instead of being run.
//! 5. **Act** – the action runs under the executor timeout. Success loops
//!    with feedback; a timeout or failure ends the session. Unknown commands
//!    fail without `LLM_ROBOT_ACTION_STARTED`, since nothing reaches the robot.
//!
//! `ABORT` is checked at the top of every iteration and also cuts short a
//! pending model call.
//!
//! Every round-trip with the model consumes one iteration, including the
//! ones answered with a correction or a warning.
//!
//! # Exclusivity
//!
//! A session holds a non-blocking lock for its whole duration. A concurrent
//! `ask` returns [`SessionOutcome::Busy`] immediately. The lock guard lives on
//! the `ask` stack frame, so it is released on every exit path; panics inside
//! the session are caught and reported as `SIMULATION_ABORTED`.
//!
//! # Termination events
//!
//! A completed session ends with `LLM_GOAL_COMPLETED`. Every other session
//! ends with exactly one `SIMULATION_ABORTED { reason }`. Both are followed by
//! `END_OF_SIMULATION`.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use llmnav_hal::{SimConfig, SimRobot};
//! use llmnav_middleware::EventBus;
//! use llmnav_runtime::{ChatGateway, ControllerConfig, GatewayConfig, LlmRobotController, SessionOutcome};
//! use llmnav_runtime::scripted::ScriptedModel;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let model = Arc::new(ScriptedModel::new("scripted").reply(
//!     r#"{"goal":"stay","scene_description":"empty room","action":{"command":"COMPLETE","parameters":0}}"#,
//! ));
//! let chat = ChatGateway::new(model, GatewayConfig { rate_limit: None, ..Default::default() });
//! let controller = LlmRobotController::new(
//!     Arc::new(SimRobot::new(SimConfig::default())),
//!     chat,
//!     EventBus::new(),
//!     ControllerConfig::default(),
//! );
//!
//! let SessionOutcome::Finished(report) = controller.ask("stay where you are", 5).await else {
//!     panic!("no other session is running");
//! };
//! assert!(report.is_completed());
//! # }
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use llmnav_hal::RobotActuator;
use llmnav_middleware::{EventBus, SubscriptionId};
use llmnav_types::{ActionStatus, Command, Event, EventType, NavError};
use serde_json::json;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::chat::ChatGateway;
use crate::executor::ActionExecutor;
use crate::parser;
use crate::prompt;
use crate::scene::SceneDescription;
use crate::streak::StreakGuard;

/// Source tag on every event published by the controller.
const EVENT_SOURCE: &str = "llmnav-runtime::controller";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration bundle for [`LlmRobotController`].
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Budget for a single action before its worker is abandoned.
    pub action_timeout: Duration,
    /// Width of the LIDAR sweep used for the scene digest and safety gate.
    pub lidar_fov_degrees: f64,
    /// Attach a JPEG camera frame to every prompt.
    pub attach_camera: bool,
    /// Abort after this many unparsable answers in a row.
    pub max_consecutive_invalid: Option<usize>,
    /// Abort after this many unsafe actions in a row.
    pub max_consecutive_dangerous: Option<usize>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            action_timeout: Duration::from_secs(30),
            lidar_fov_degrees: 90.0,
            attach_camera: true,
            max_consecutive_invalid: None,
            max_consecutive_dangerous: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session results
// ─────────────────────────────────────────────────────────────────────────────

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The model answered `COMPLETE`.
    Completed,
    /// The iteration budget ran out first.
    MaxIterationsReached,
    /// An external `ABORT` was observed.
    Aborted(String),
    /// An action failed or timed out, the model could not be reached, or an
    /// unexpected error occurred.
    Failed(String),
}

impl Disposition {
    /// Reason carried by `SIMULATION_ABORTED`; `None` for a completed session.
    pub fn abort_reason(&self, iterations: usize) -> Option<String> {
        match self {
            Disposition::Completed => None,
            Disposition::MaxIterationsReached => {
                Some(format!("Max iterations reached ({iterations})"))
            }
            Disposition::Aborted(reason) | Disposition::Failed(reason) => Some(reason.clone()),
        }
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: Uuid,
    pub iterations: usize,
    pub disposition: Disposition,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SessionReport {
    pub fn is_completed(&self) -> bool {
        self.disposition == Disposition::Completed
    }
}

/// Result of [`LlmRobotController::ask`].
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    /// Another session holds the lock; nothing was started.
    Busy,
    Finished(SessionReport),
}

// ─────────────────────────────────────────────────────────────────────────────
// Abort signal
// ─────────────────────────────────────────────────────────────────────────────

/// Cooperative cancellation flag set from the event bus.
///
/// The first reason raised wins until it is taken.
#[derive(Debug, Clone)]
struct AbortSignal(Arc<watch::Sender<Option<String>>>);

impl Default for AbortSignal {
    fn default() -> Self {
        Self(Arc::new(watch::Sender::new(None)))
    }
}

impl AbortSignal {
    fn raise(&self, reason: String) {
        self.0.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
            true
        });
    }

    fn take(&self) -> Option<String> {
        let mut taken = None;
        self.0.send_if_modified(|slot| {
            taken = slot.take();
            false
        });
        taken
    }

    fn clear(&self) {
        self.take();
    }

    /// Resolves with the reason once an abort is raised; the reason is
    /// consumed.
    async fn raised(&self) -> String {
        let mut rx = self.0.subscribe();
        if rx.wait_for(Option::is_some).await.is_err() {
            // The sender lives as long as `self`.
            return std::future::pending().await;
        }
        self.take().unwrap_or_default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LlmRobotController
// ─────────────────────────────────────────────────────────────────────────────

/// Drives a robot from model answers, one exclusive session at a time.
pub struct LlmRobotController {
    robot: Arc<dyn RobotActuator>,
    executor: ActionExecutor,
    chat: AsyncMutex<ChatGateway>,
    bus: EventBus,
    config: ControllerConfig,
    session: AsyncMutex<()>,
    abort: AbortSignal,
    abort_subscription: SubscriptionId,
}

impl LlmRobotController {
    /// Wire the controller to `robot`, `chat` and `bus`.
    ///
    /// The controller subscribes to [`EventType::Abort`] on `bus`; the
    /// subscription is removed when the controller is dropped.
    pub fn new(
        robot: Arc<dyn RobotActuator>,
        chat: ChatGateway,
        bus: EventBus,
        config: ControllerConfig,
    ) -> Self {
        let abort = AbortSignal::default();
        let signal = abort.clone();
        let abort_subscription = bus.subscribe(EventType::Abort, move |event: &Event| {
            let reason = event.str_field("reason").unwrap_or("abort requested");
            signal.raise(reason.to_string());
            Ok(())
        });

        Self {
            executor: ActionExecutor::new(robot.clone(), config.action_timeout),
            robot,
            chat: AsyncMutex::new(chat),
            bus,
            config,
            session: AsyncMutex::new(()),
            abort,
            abort_subscription,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// `true` while a session holds the lock.
    pub fn is_busy(&self) -> bool {
        self.session.try_lock().is_err()
    }

    /// Request cooperative cancellation of the running session by publishing
    /// `ABORT` on the bus. Observed at the top of the next iteration, or
    /// immediately while the session waits for the model.
    pub fn abort(&self, reason: &str) {
        self.bus.publish(Event::new(
            EVENT_SOURCE,
            EventType::Abort,
            json!({ "reason": reason }),
        ));
    }

    /// Run one session for `prompt` with at most `max_iterations` model
    /// round-trips.
    pub async fn ask(&self, prompt: &str, max_iterations: usize) -> SessionOutcome {
        let Ok(_session) = self.session.try_lock() else {
            warn!("session already in progress, ignoring request");
            return SessionOutcome::Busy;
        };

        self.abort.clear();
        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut iterations = 0usize;
        let mut chat = self.chat.lock().await;
        chat.clear();

        let span = info_span!("session", %id);
        let disposition = async {
            info!(prompt, max_iterations, "session started");
            self.emit(
                EventType::SimulationStarted,
                json!({
                    "id": id.to_string(),
                    "model": chat.model_name(),
                    "prompt": prompt,
                    "system_prompt": chat.system_instruction(),
                }),
            );

            let run = self.run_session(&mut chat, prompt, max_iterations, &mut iterations);
            match AssertUnwindSafe(run).catch_unwind().await {
                Ok(disposition) => disposition,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(error = %message, "session panicked");
                    Disposition::Failed(format!("unexpected error: {message}"))
                }
            }
        }
        .instrument(span)
        .await;

        if let Some(reason) = disposition.abort_reason(iterations) {
            warn!(session = %id, iterations, %reason, "session aborted");
            self.emit(EventType::SimulationAborted, json!({ "reason": reason }));
        } else {
            info!(session = %id, iterations, "session completed");
        }
        self.emit(
            EventType::EndOfSimulation,
            json!({
                "id": id.to_string(),
                "iterations": iterations,
                "completed": disposition == Disposition::Completed,
            }),
        );

        SessionOutcome::Finished(SessionReport {
            id,
            iterations,
            disposition,
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn run_session(
        &self,
        chat: &mut ChatGateway,
        user_prompt: &str,
        max_iterations: usize,
        iterations: &mut usize,
    ) -> Disposition {
        let mut lead = user_prompt.to_string();
        let mut invalid_streak = StreakGuard::new(self.config.max_consecutive_invalid);
        let mut dangerous_streak = StreakGuard::new(self.config.max_consecutive_dangerous);

        loop {
            if let Some(reason) = self.abort.take() {
                info!(%reason, "abort requested");
                return Disposition::Aborted(reason);
            }
            if *iterations >= max_iterations {
                self.emit(
                    EventType::LlmMaxIterationsReached,
                    json!({ "iterations": *iterations }),
                );
                return Disposition::MaxIterationsReached;
            }

            // ── Observe ──────────────────────────────────────────────────────
            let (message, image) = match self.observe(&lead) {
                Ok(observation) => observation,
                Err(e) => return Disposition::Failed(format!("sensor read failed: {e}")),
            };

            // ── Ask ──────────────────────────────────────────────────────────
            let iteration = *iterations + 1;
            self.emit(
                EventType::SendingMessageToLlm,
                json!({
                    "message": message,
                    "iteration": iteration,
                    "image": image.is_some(),
                }),
            );
            let sent = tokio::select! {
                sent = chat.send(&message, image.as_deref()) => sent,
                reason = self.abort.raised() => {
                    info!(%reason, "abort requested while waiting for the model");
                    return Disposition::Aborted(reason);
                }
            };
            let response = match sent {
                Ok(response) => response,
                Err(e) if e.is_timeout() => {
                    warn!(iteration, error = %e, "model did not answer in time");
                    self.emit(
                        EventType::LlmResponseTimeout,
                        json!({ "error": e.to_string(), "iteration": iteration }),
                    );
                    return Disposition::Failed(format!("LLM response timeout: {e}"));
                }
                Err(e) if e.is_rate_limit() => {
                    self.emit(
                        EventType::LlmRateLimitExceeded,
                        json!({ "error": e.to_string() }),
                    );
                    return Disposition::Failed(format!("LLM rate limit exceeded: {e}"));
                }
                Err(e) => return Disposition::Failed(format!("LLM request failed: {e}")),
            };
            *iterations = iteration;
            self.emit(
                EventType::MessageReceivedFromLlm,
                json!({ "response": response, "iteration": iteration }),
            );

            // ── Parse ────────────────────────────────────────────────────────
            let action = match parser::parse(&response) {
                Ok(action) => {
                    invalid_streak.reset();
                    action
                }
                Err(err) => {
                    warn!(iteration, error = %err, "invalid model response");
                    self.emit(
                        EventType::LlmInvalidJsonSchema,
                        json!({
                            "response": response,
                            "error": err.to_string(),
                            "kind": err.kind,
                        }),
                    );
                    if invalid_streak.record() {
                        self.emit(
                            EventType::LlmTooManyInvalidJson,
                            json!({ "count": invalid_streak.count() }),
                        );
                        return Disposition::Failed(format!(
                            "Too many invalid responses in a row ({})",
                            invalid_streak.count()
                        ));
                    }
                    lead = prompt::correction_message(&err);
                    continue;
                }
            };
            debug!(iteration, command = %action.command, parameter = action.parameter, "model chose action");

            if action.command == Command::Complete {
                self.emit(
                    EventType::LlmGoalCompleted,
                    json!({ "action": action, "iterations": iteration }),
                );
                return Disposition::Completed;
            }

            // ── Gate ─────────────────────────────────────────────────────────
            let lidar = match self.robot.front_range_readings(self.config.lidar_fov_degrees) {
                Ok(lidar) => lidar,
                Err(e) => return Disposition::Failed(format!("sensor read failed: {e}")),
            };
            if let Err(violation) = self.executor.verify(&action, &lidar) {
                warn!(iteration, command = %action.command, parameter = action.parameter, %violation, "dangerous action rejected");
                self.emit(
                    EventType::LlmDangerousAction,
                    json!({ "action": action, "reason": violation.to_string() }),
                );
                if dangerous_streak.record() {
                    self.emit(
                        EventType::LlmTooManyDangerousActions,
                        json!({ "count": dangerous_streak.count() }),
                    );
                    return Disposition::Failed(format!(
                        "Too many dangerous actions in a row ({})",
                        dangerous_streak.count()
                    ));
                }
                lead = prompt::dangerous_action_message(&action);
                continue;
            }
            dangerous_streak.reset();

            // ── Act ──────────────────────────────────────────────────────────
            if !matches!(action.command, Command::Unknown(_)) {
                self.emit(EventType::LlmExecutingRobotAction, json!({ "action": action }));
            }
            let result = self.executor.execute(&action).await;
            match result.status {
                ActionStatus::Success => {
                    self.emit(
                        EventType::LlmRobotActionCompleted,
                        json!({ "action": action, "result": result }),
                    );
                    lead = prompt::action_feedback(&action, &result);
                }
                ActionStatus::Aborted => {
                    self.emit(
                        EventType::LlmRobotActionAborted,
                        json!({ "action": action, "result": result }),
                    );
                    return Disposition::Failed(format!("Action {} timed out", action.command));
                }
                ActionStatus::Failure | ActionStatus::ObstacleDetected => {
                    self.emit(
                        EventType::LlmRobotActionFailed,
                        json!({ "action": action, "result": result }),
                    );
                    return Disposition::Failed(format!(
                        "Action {} failed: {}",
                        action.command, result.message
                    ));
                }
            }
        }
    }

    /// Prompt text (lead + scene digest) and optional base64 camera frame.
    fn observe(&self, lead: &str) -> Result<(String, Option<String>), NavError> {
        let lidar = self.robot.front_range_readings(self.config.lidar_fov_degrees)?;
        let scene = SceneDescription::from_lidar(&lidar);
        let message = prompt::compose(lead, &scene.to_string());

        let image = if self.config.attach_camera {
            match self.robot.camera_image().and_then(|frame| frame.to_base64_jpeg()) {
                Ok(image) => Some(image),
                Err(e) => {
                    warn!(error = %e, "camera frame unavailable, sending text only");
                    None
                }
            }
        } else {
            None
        };
        Ok((message, image))
    }

    fn emit(&self, kind: EventType, payload: serde_json::Value) {
        self.bus.publish(Event::new(EVENT_SOURCE, kind, payload));
    }
}

impl Drop for LlmRobotController {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.abort_subscription);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use llmnav_hal::{CameraFrame, LidarSnapshot, Obstacle, SimConfig, SimRobot};

    use super::*;
    use crate::chat::GatewayConfig;
    use crate::llm_driver::Role;
    use crate::scripted::{Reply, ScriptedModel};

    fn respond(command: &str, parameter: f64) -> String {
        format!(
            r#"{{"goal":"reach the crate","scene_description":"open floor","action":{{"command":"{command}","parameters":{parameter}}}}}"#
        )
    }

    fn fast_gateway(model: &Arc<ScriptedModel>) -> ChatGateway {
        let config = GatewayConfig {
            retry_delay: Duration::from_millis(1),
            rate_limit: None,
            ..GatewayConfig::default()
        };
        gateway_with(model, config)
    }

    fn gateway_with(model: &Arc<ScriptedModel>, config: GatewayConfig) -> ChatGateway {
        ChatGateway::new(model.clone(), config).with_system_instruction(prompt::DEFAULT_SYSTEM_INSTRUCTION)
    }

    fn test_config() -> ControllerConfig {
        ControllerConfig {
            action_timeout: Duration::from_secs(10),
            attach_camera: false,
            ..ControllerConfig::default()
        }
    }

    struct Harness {
        controller: Arc<LlmRobotController>,
        model: Arc<ScriptedModel>,
        robot: Arc<SimRobot>,
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl Harness {
        fn new(model: ScriptedModel, sim: SimConfig, config: ControllerConfig) -> Self {
            let model = Arc::new(model);
            let chat = fast_gateway(&model);
            Self::with_gateway(model, chat, sim, config)
        }

        fn with_gateway(
            model: Arc<ScriptedModel>,
            chat: ChatGateway,
            sim: SimConfig,
            config: ControllerConfig,
        ) -> Self {
            let robot = Arc::new(SimRobot::new(sim));
            let bus = EventBus::new();
            let events = Arc::new(Mutex::new(Vec::new()));
            let sink = events.clone();
            bus.subscribe_all(move |event| {
                sink.lock().unwrap().push(event.clone());
                Ok(())
            });
            let controller = Arc::new(LlmRobotController::new(robot.clone(), chat, bus, config));
            Self {
                controller,
                model,
                robot,
                events,
            }
        }

        fn simple(model: ScriptedModel) -> Self {
            Self::new(model, SimConfig::default(), test_config())
        }

        fn kinds(&self) -> Vec<EventType> {
            self.events.lock().unwrap().iter().map(|e| e.kind).collect()
        }

        fn count(&self, kind: EventType) -> usize {
            self.kinds().iter().filter(|k| **k == kind).count()
        }

        fn last(&self, kind: EventType) -> Event {
            self.events
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|e| e.kind == kind)
                .cloned()
                .unwrap()
        }

        /// Text of the last user turn in the `n`-th request.
        fn user_text(&self, n: usize) -> String {
            let requests = self.model.requests();
            requests[n]
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .unwrap()
                .text()
        }
    }

    fn finished(outcome: SessionOutcome) -> SessionReport {
        match outcome {
            SessionOutcome::Finished(report) => report,
            SessionOutcome::Busy => panic!("expected a finished session"),
        }
    }

    #[tokio::test]
    async fn happy_path_event_sequence() {
        let h = Harness::simple(
            ScriptedModel::new("scripted")
                .reply(respond("FRONT", 1.0))
                .reply(respond("COMPLETE", 0.0)),
        );
        let report = finished(h.controller.ask("go to the crate", 10).await);

        assert_eq!(report.disposition, Disposition::Completed);
        assert_eq!(report.iterations, 2);
        assert_eq!(
            h.kinds(),
            vec![
                EventType::SimulationStarted,
                EventType::SendingMessageToLlm,
                EventType::MessageReceivedFromLlm,
                EventType::LlmExecutingRobotAction,
                EventType::LlmRobotActionCompleted,
                EventType::SendingMessageToLlm,
                EventType::MessageReceivedFromLlm,
                EventType::LlmGoalCompleted,
                EventType::EndOfSimulation,
            ]
        );
        assert!((h.robot.pose().unwrap().x - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn start_event_carries_session_metadata() {
        let h = Harness::simple(ScriptedModel::new("scripted").reply(respond("COMPLETE", 0.0)));
        let report = finished(h.controller.ask("go to the crate", 3).await);

        let started = h.last(EventType::SimulationStarted);
        assert_eq!(started.str_field("model"), Some("scripted"));
        assert_eq!(started.str_field("prompt"), Some("go to the crate"));
        assert_eq!(started.str_field("id"), Some(report.id.to_string().as_str()));
        assert!(started.str_field("system_prompt").unwrap().contains("ROTATE_LEFT"));

        let end = h.last(EventType::EndOfSimulation);
        assert_eq!(end.field("completed"), Some(&json!(true)));
        assert_eq!(end.field("iterations"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn first_prompt_contains_goal_and_scene() {
        let h = Harness::simple(ScriptedModel::new("scripted").reply(respond("COMPLETE", 0.0)));
        h.controller.ask("go to the crate", 3).await;
        let text = h.user_text(0);
        assert!(text.starts_with("go to the crate"));
        assert!(text.contains("Lidar distances:"));
    }

    #[tokio::test]
    async fn iteration_cap_stops_after_exact_round_trips() {
        let h = Harness::simple(
            ScriptedModel::new("scripted").then_repeat(Reply::Text(respond("ROTATE_LEFT", 10.0))),
        );
        let report = finished(h.controller.ask("spin", 5).await);

        assert_eq!(report.disposition, Disposition::MaxIterationsReached);
        assert_eq!(report.iterations, 5);
        assert_eq!(h.model.calls(), 5);
        assert_eq!(h.count(EventType::LlmMaxIterationsReached), 1);
        assert_eq!(h.count(EventType::SimulationAborted), 1);
        assert_eq!(
            h.last(EventType::SimulationAborted).str_field("reason"),
            Some("Max iterations reached (5)")
        );
        assert_eq!(h.kinds().last(), Some(&EventType::EndOfSimulation));
    }

    #[tokio::test]
    async fn malformed_reply_is_corrected_and_consumes_an_iteration() {
        let h = Harness::simple(
            ScriptedModel::new("scripted")
                .reply("I would like to move forward a bit.")
                .reply(respond("COMPLETE", 0.0)),
        );
        let report = finished(h.controller.ask("go to the crate", 10).await);

        assert!(report.is_completed());
        assert_eq!(report.iterations, 2);
        assert_eq!(h.count(EventType::LlmInvalidJsonSchema), 1);
        assert_eq!(h.count(EventType::SimulationAborted), 0);
        let correction = h.user_text(1);
        assert!(correction.contains("could not be used"));
        assert!(correction.contains("\"action\""));
    }

    #[tokio::test]
    async fn second_ask_while_running_is_busy() {
        let h = Harness::simple(
            ScriptedModel::new("scripted")
                .with_delay(Duration::from_millis(300))
                .reply(respond("COMPLETE", 0.0))
                .reply(respond("COMPLETE", 0.0)),
        );

        let first = {
            let controller = h.controller.clone();
            tokio::spawn(async move { controller.ask("first", 5).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(h.controller.is_busy());
        assert!(matches!(h.controller.ask("second", 5).await, SessionOutcome::Busy));

        let report = finished(first.await.unwrap());
        assert!(report.is_completed());
        assert!(!h.controller.is_busy());

        let again = finished(h.controller.ask("third", 5).await);
        assert!(again.is_completed());
        assert_eq!(h.model.calls(), 2);
        assert_eq!(h.count(EventType::SimulationStarted), 2);
    }

    #[tokio::test]
    async fn dangerous_action_is_not_executed() {
        let sim = SimConfig::default().with_obstacle(Obstacle::new(1.0, 0.0, 0.1));
        let h = Harness::new(
            ScriptedModel::new("scripted")
                .reply(respond("FRONT", 2.0))
                .reply(respond("COMPLETE", 0.0)),
            sim,
            test_config(),
        );
        let report = finished(h.controller.ask("drive through the crate", 10).await);

        assert!(report.is_completed());
        assert_eq!(h.count(EventType::LlmDangerousAction), 1);
        assert_eq!(h.count(EventType::LlmExecutingRobotAction), 0);
        assert_eq!(h.robot.pose().unwrap().x, 0.0);
        assert!(
            h.user_text(1)
                .starts_with("The given action: FRONT with parameter 2 is considered dangerous")
        );
    }

    #[tokio::test]
    async fn rate_limit_exhaustion_aborts_session() {
        let h = Harness::simple(ScriptedModel::new("scripted").then_repeat(Reply::RateLimited));
        let report = finished(h.controller.ask("go", 10).await);

        assert!(matches!(report.disposition, Disposition::Failed(_)));
        assert_eq!(report.iterations, 0);
        assert_eq!(h.model.calls(), 3);
        assert_eq!(
            h.kinds(),
            vec![
                EventType::SimulationStarted,
                EventType::SendingMessageToLlm,
                EventType::LlmRateLimitExceeded,
                EventType::SimulationAborted,
                EventType::EndOfSimulation,
            ]
        );
    }

    #[tokio::test]
    async fn failed_action_terminates_session() {
        // Safe per the sweep (0.2 m free) but the body collides before 0.15 m.
        let sim = SimConfig::default().with_obstacle(Obstacle::new(0.3, 0.0, 0.1));
        let h = Harness::new(
            ScriptedModel::new("scripted")
                .reply(respond("FRONT", 0.15))
                .then_repeat(Reply::Text(respond("COMPLETE", 0.0))),
            sim,
            test_config(),
        );
        let report = finished(h.controller.ask("touch the crate", 10).await);

        assert!(matches!(report.disposition, Disposition::Failed(_)));
        assert_eq!(h.model.calls(), 1);
        assert_eq!(h.count(EventType::LlmRobotActionFailed), 1);
        assert_eq!(h.count(EventType::LlmGoalCompleted), 0);
        let failed = h.last(EventType::LlmRobotActionFailed);
        assert_eq!(failed.field("result").unwrap()["status"], "OBSTACLE_DETECTED");
    }

    #[tokio::test]
    async fn unknown_command_fails_session() {
        let h = Harness::simple(ScriptedModel::new("scripted").reply(respond("JUMP", 1.0)));
        let report = finished(h.controller.ask("jump", 10).await);

        assert_eq!(
            report.disposition,
            Disposition::Failed("Action JUMP failed: Unknown command".to_string())
        );
        assert_eq!(h.count(EventType::LlmExecutingRobotAction), 0);
        assert_eq!(h.count(EventType::LlmRobotActionFailed), 1);
    }

    #[tokio::test]
    async fn action_timeout_is_reported_as_aborted_action() {
        let config = ControllerConfig {
            action_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let h = Harness::new(
            ScriptedModel::new("scripted").reply(respond("FRONT", 3.0)),
            SimConfig::default().real_time(true),
            config,
        );
        let report = finished(h.controller.ask("go far", 10).await);

        assert!(matches!(report.disposition, Disposition::Failed(_)));
        assert_eq!(h.count(EventType::LlmRobotActionAborted), 1);
        assert_eq!(h.count(EventType::SimulationAborted), 1);
    }

    #[tokio::test]
    async fn abort_event_stops_session_between_iterations() {
        let h = Harness::simple(
            ScriptedModel::new("scripted")
                .with_delay(Duration::from_millis(100))
                .then_repeat(Reply::Text(respond("ROTATE_LEFT", 5.0))),
        );
        let running = {
            let controller = h.controller.clone();
            tokio::spawn(async move { controller.ask("spin forever", 50).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        h.controller.abort("operator request");

        let report = finished(running.await.unwrap());
        assert_eq!(report.disposition, Disposition::Aborted("operator request".to_string()));
        assert!(report.iterations < 50);
        assert_eq!(h.count(EventType::Abort), 1);
        assert_eq!(
            h.last(EventType::SimulationAborted).str_field("reason"),
            Some("operator request")
        );
    }

    #[tokio::test]
    async fn abort_interrupts_a_stalled_model_call() {
        let model = Arc::new(
            ScriptedModel::new("scripted")
                .with_delay(Duration::from_secs(3600))
                .then_repeat(Reply::Text(respond("COMPLETE", 0.0))),
        );
        let config = GatewayConfig {
            rate_limit: None,
            response_timeout: None,
            ..GatewayConfig::default()
        };
        let chat = gateway_with(&model, config);
        let h = Harness::with_gateway(model, chat, SimConfig::default(), test_config());

        let running = {
            let controller = h.controller.clone();
            tokio::spawn(async move { controller.ask("go", 5).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.controller.abort("operator");

        let outcome = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .expect("ask returns after ABORT")
            .unwrap();
        let report = finished(outcome);
        assert_eq!(report.disposition, Disposition::Aborted("operator".to_string()));
        assert_eq!(report.iterations, 0);
        assert!(!h.controller.is_busy());
        assert_eq!(h.kinds().last(), Some(&EventType::EndOfSimulation));
        assert_eq!(h.count(EventType::MessageReceivedFromLlm), 0);
    }

    #[tokio::test]
    async fn response_timeout_fails_session() {
        let model = Arc::new(
            ScriptedModel::new("scripted")
                .with_delay(Duration::from_secs(3600))
                .then_repeat(Reply::Text(respond("COMPLETE", 0.0))),
        );
        let config = GatewayConfig {
            rate_limit: None,
            response_timeout: Some(Duration::from_millis(50)),
            ..GatewayConfig::default()
        };
        let chat = gateway_with(&model, config);
        let h = Harness::with_gateway(model, chat, SimConfig::default(), test_config());

        let report = finished(h.controller.ask("go", 5).await);
        assert!(matches!(report.disposition, Disposition::Failed(_)));
        assert_eq!(
            h.kinds(),
            vec![
                EventType::SimulationStarted,
                EventType::SendingMessageToLlm,
                EventType::LlmResponseTimeout,
                EventType::SimulationAborted,
                EventType::EndOfSimulation,
            ]
        );
        let reason = h.last(EventType::SimulationAborted);
        assert!(reason.str_field("reason").unwrap().starts_with("LLM response timeout"));
        assert!(!h.controller.is_busy());
    }

    #[tokio::test]
    async fn invalid_streak_limit_aborts() {
        let config = ControllerConfig {
            max_consecutive_invalid: Some(2),
            ..test_config()
        };
        let h = Harness::new(
            ScriptedModel::new("scripted").then_repeat(Reply::Text("no json here".into())),
            SimConfig::default(),
            config,
        );
        let report = finished(h.controller.ask("go", 10).await);

        assert_eq!(report.iterations, 2);
        assert_eq!(h.count(EventType::LlmTooManyInvalidJson), 1);
        assert!(matches!(report.disposition, Disposition::Failed(_)));
    }

    #[tokio::test]
    async fn dangerous_streak_limit_aborts() {
        let config = ControllerConfig {
            max_consecutive_dangerous: Some(2),
            ..test_config()
        };
        let h = Harness::new(
            ScriptedModel::new("scripted").then_repeat(Reply::Text(respond("FRONT", 5.0))),
            SimConfig::default().with_obstacle(Obstacle::new(1.0, 0.0, 0.1)),
            config,
        );
        let report = finished(h.controller.ask("go", 10).await);

        assert_eq!(report.iterations, 2);
        assert_eq!(h.count(EventType::LlmTooManyDangerousActions), 1);
    }

    #[tokio::test]
    async fn camera_frame_is_attached_when_enabled() {
        let config = ControllerConfig {
            attach_camera: true,
            ..test_config()
        };
        let h = Harness::new(
            ScriptedModel::new("scripted").reply(respond("COMPLETE", 0.0)),
            SimConfig::default(),
            config,
        );
        h.controller.ask("look around", 3).await;
        let request = &h.model.requests()[0];
        assert!(request.last().unwrap().has_image());
        assert_eq!(
            h.last(EventType::SendingMessageToLlm).field("image"),
            Some(&json!(true))
        );
    }

    /// Robot whose sensor read panics.
    struct BrokenRobot;

    impl RobotActuator for BrokenRobot {
        fn move_forward(&self, _: Option<f64>) -> Result<(), NavError> {
            Ok(())
        }
        fn move_backward(&self, _: Option<f64>) -> Result<(), NavError> {
            Ok(())
        }
        fn rotate_left(&self, _: Option<f64>) -> Result<(), NavError> {
            Ok(())
        }
        fn rotate_right(&self, _: Option<f64>) -> Result<(), NavError> {
            Ok(())
        }
        fn stop(&self) -> Result<(), NavError> {
            Ok(())
        }
        fn camera_image(&self) -> Result<CameraFrame, NavError> {
            Ok(CameraFrame::new(1, 1, vec![0; 3]))
        }
        fn front_range_readings(&self, _: f64) -> Result<LidarSnapshot, NavError> {
            panic!("lidar driver crashed")
        }
    }

    #[tokio::test]
    async fn panic_inside_session_releases_lock() {
        let model = Arc::new(ScriptedModel::new("scripted").then_repeat(Reply::Text(respond("COMPLETE", 0.0))));
        let bus = EventBus::new();
        let (_, mut rx) = bus.subscribe_channel(None);
        let controller = LlmRobotController::new(
            Arc::new(BrokenRobot),
            fast_gateway(&model),
            bus,
            test_config(),
        );

        let report = finished(controller.ask("go", 3).await);
        assert_eq!(
            report.disposition,
            Disposition::Failed("unexpected error: lidar driver crashed".to_string())
        );
        assert!(!controller.is_busy());
        assert!(matches!(controller.ask("again", 3).await, SessionOutcome::Finished(_)));

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(
            &kinds[..3],
            &[
                EventType::SimulationStarted,
                EventType::SimulationAborted,
                EventType::EndOfSimulation,
            ]
        );
    }

    #[test]
    fn abort_reasons() {
        assert_eq!(Disposition::Completed.abort_reason(3), None);
        assert_eq!(
            Disposition::MaxIterationsReached.abort_reason(7).as_deref(),
            Some("Max iterations reached (7)")
        );
        assert_eq!(
            Disposition::Failed("boom".into()).abort_reason(1).as_deref(),
            Some("boom")
        );
    }
}
