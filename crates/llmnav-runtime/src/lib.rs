//! `llmnav-runtime` – the model-driven control loop.
//!
//! Everything between "the user typed a goal" and "the wheels turned" lives
//! here.
//!
//! # Modules
//!
//! - [`controller`] – [`LlmRobotController`]: runs one exclusive session per
//!   [`ask`][LlmRobotController::ask], cycling observe → ask → parse → gate →
//!   act and publishing every step on the event bus.
//! - [`chat`] – [`ChatGateway`]: system instruction, bounded history,
//!   client-side rate limiting and rate-limit retries.
//! - [`llm_driver`] – the [`ModelClient`] trait and [`OpenAiClient`], an
//!   OpenAI-compatible `/v1/chat/completions` client with image support.
//! - [`scripted`] – [`ScriptedModel`][scripted::ScriptedModel], a model that
//!   replays canned answers for dry runs and tests.
//! - [`parser`] – turns raw model text into a
//!   [`RobotAction`][llmnav_types::RobotAction] or a classified
//!   [`ParseError`][llmnav_types::ParseError].
//! - [`scene`] – three-sector LIDAR digest injected into every prompt.
//! - [`prompt`] – system instruction and the correction, warning and
//!   feedback texts.
//! - [`executor`] – [`ActionExecutor`]: safety rules plus timed dispatch to
//!   the [`RobotActuator`][llmnav_hal::RobotActuator].
//! - [`streak`] – consecutive-failure guard.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing].

pub mod chat;
pub mod controller;
pub mod executor;
pub mod llm_driver;
pub mod parser;
pub mod prompt;
pub mod scene;
pub mod scripted;
pub mod streak;
pub mod telemetry;

pub use chat::{ChatGateway, GatewayConfig, RateLimit};
pub use controller::{
    ControllerConfig, Disposition, LlmRobotController, SessionOutcome, SessionReport,
};
pub use executor::{ActionExecutor, FrontClearanceRule, SafetyRule};
pub use llm_driver::{ChatMessage, LlmError, ModelClient, OpenAiClient, Role};
pub use scene::SceneDescription;
pub use streak::StreakGuard;
pub use telemetry::{TracerProviderGuard, init_tracing};
