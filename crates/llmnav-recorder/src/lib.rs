//! `llmnav-recorder` – session traces for offline scoring.
//!
//! # Modules
//!
//! - [`recorder`] – [`SessionRecorder`]: listens to every event on the bus
//!   and builds the trace of the running session.
//! - [`trace`] – [`SessionTrace`] and [`IterationTrace`], the persisted
//!   camelCase JSON format.
//! - [`store`] – [`TraceStore`]: one `session_<id>.json` file per session.

pub mod recorder;
pub mod store;
pub mod trace;

pub use recorder::SessionRecorder;
pub use store::{RecorderError, TraceStore};
pub use trace::{IterationOutcome, IterationTrace, SessionTrace};
