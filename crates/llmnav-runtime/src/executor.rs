//! [`ActionExecutor`] – safety gate and timed execution of robot actions.
//!
//! # Safety gate
//!
//! Before an action runs, [`ActionExecutor::check_safety`] evaluates every
//! registered [`SafetyRule`] against a fresh LIDAR sweep. The default rule
//! set holds only [`FrontClearanceRule`]: a `FRONT` move is unsafe when any
//! reading is closer than the commanded distance. There is no re-check while
//! the robot is moving.
//!
//! # Execution
//!
//! [`ActionExecutor::execute`] dispatches the command to the matching
//! [`RobotActuator`] primitive on a blocking worker and waits at most the
//! configured timeout. Whatever the outcome (success, device error, unknown
//! command or timeout) the robot is stopped exactly once before the result is
//! returned. A timed-out worker is abandoned; the stop call ends its motion.

use std::sync::Arc;
use std::time::Duration;

use llmnav_hal::{LidarSnapshot, RobotActuator};
use llmnav_types::{ActionResult, Command, NavError, RobotAction};
use tracing::{debug, error, info, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Safety rules
// ─────────────────────────────────────────────────────────────────────────────

/// A pre-execution check an action must pass.
pub trait SafetyRule: Send + Sync {
    /// Human-readable name used in log messages.
    fn name(&self) -> &str;

    /// Return `Ok(())` when `action` is safe to run given `lidar`.
    fn check(&self, action: &RobotAction, lidar: &LidarSnapshot) -> Result<(), NavError>;
}

/// Rejects forward moves longer than the nearest range reading.
///
/// Every other command passes unconditionally, as does a sweep with no
/// readings.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrontClearanceRule;

impl SafetyRule for FrontClearanceRule {
    fn name(&self) -> &str {
        "front_clearance"
    }

    fn check(&self, action: &RobotAction, lidar: &LidarSnapshot) -> Result<(), NavError> {
        if action.command != Command::Front {
            return Ok(());
        }
        match lidar.min_distance() {
            Some(nearest) if nearest < action.parameter => {
                Err(NavError::ObstacleDetected { distance: nearest })
            }
            _ => Ok(()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch
// ─────────────────────────────────────────────────────────────────────────────

type Motion = fn(&dyn RobotActuator, Option<f64>) -> Result<(), NavError>;

/// Actuator primitive for `command`; `None` for commands that do not move
/// the robot.
fn motion_for(command: &Command) -> Option<Motion> {
    let motion: Motion = match command {
        Command::Front => |robot, m| robot.move_forward(m),
        Command::Back => |robot, m| robot.move_backward(m),
        Command::RotateLeft => |robot, m| robot.rotate_left(m),
        Command::RotateRight => |robot, m| robot.rotate_right(m),
        Command::Complete | Command::Unknown(_) => return None,
    };
    Some(motion)
}

// ─────────────────────────────────────────────────────────────────────────────
// ActionExecutor
// ─────────────────────────────────────────────────────────────────────────────

/// Runs [`RobotAction`]s against a [`RobotActuator`].
pub struct ActionExecutor {
    robot: Arc<dyn RobotActuator>,
    timeout: Duration,
    rules: Vec<Box<dyn SafetyRule>>,
}

impl std::fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("timeout", &self.timeout)
            .field("rules", &self.rules.iter().map(|r| r.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl ActionExecutor {
    /// Executor with the default rule set ([`FrontClearanceRule`]).
    pub fn new(robot: Arc<dyn RobotActuator>, timeout: Duration) -> Self {
        Self {
            robot,
            timeout,
            rules: vec![Box::new(FrontClearanceRule)],
        }
    }

    pub fn add_rule(&mut self, rule: Box<dyn SafetyRule>) {
        self.rules.push(rule);
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// First rule violation for `action`, if any.
    pub fn verify(&self, action: &RobotAction, lidar: &LidarSnapshot) -> Result<(), NavError> {
        for rule in &self.rules {
            if let Err(e) = rule.check(action, lidar) {
                debug!(rule = rule.name(), command = %action.command, error = %e, "safety rule rejected action");
                return Err(e);
            }
        }
        Ok(())
    }

    /// `true` when every safety rule accepts `action`.
    pub fn check_safety(&self, action: &RobotAction, lidar: &LidarSnapshot) -> bool {
        self.verify(action, lidar).is_ok()
    }

    /// Run `action` with the configured timeout and stop the robot afterwards.
    pub async fn execute(&self, action: &RobotAction) -> ActionResult {
        let result = self.run(action).await;
        if let Err(e) = self.robot.stop() {
            error!(error = %e, "failed to stop robot after action");
        }
        info!(
            command = %action.command,
            parameter = action.parameter,
            status = ?result.status,
            "action finished"
        );
        result
    }

    async fn run(&self, action: &RobotAction) -> ActionResult {
        let Some(motion) = motion_for(&action.command) else {
            warn!(command = %action.command, "no handler for command");
            return ActionResult::failure("Unknown command");
        };

        let robot = self.robot.clone();
        let parameter = action.parameter;
        let worker = tokio::task::spawn_blocking(move || motion(robot.as_ref(), Some(parameter)));

        match tokio::time::timeout(self.timeout, worker).await {
            Ok(Ok(Ok(()))) => {
                ActionResult::success(format!("{} {} completed", action.command, parameter))
            }
            Ok(Ok(Err(NavError::ObstacleDetected { distance }))) => ActionResult::obstacle(format!(
                "{} {} stopped: obstacle detected {distance:.2} m ahead",
                action.command, parameter
            )),
            Ok(Ok(Err(e))) => ActionResult::failure(format!("{} {} failed: {e}", action.command, parameter)),
            Ok(Err(join)) => ActionResult::failure(format!("action worker crashed: {join}")),
            Err(_) => {
                warn!(command = %action.command, timeout_ms = self.timeout.as_millis() as u64, "action timed out");
                ActionResult::aborted(format!(
                    "{} {} timed out after {:.1}s",
                    action.command,
                    parameter,
                    self.timeout.as_secs_f64()
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use llmnav_hal::CameraFrame;
    use llmnav_types::ActionStatus;

    use super::*;

    /// Robot whose motions take `motion_time` unless stopped, and which
    /// counts `stop` calls.
    struct CountingRobot {
        motion_time: Duration,
        fail_with: Option<NavError>,
        stopped: AtomicBool,
        stops: AtomicUsize,
        moves: Mutex<Vec<String>>,
    }

    impl CountingRobot {
        fn new(motion_time: Duration) -> Arc<Self> {
            Arc::new(Self {
                motion_time,
                fail_with: None,
                stopped: AtomicBool::new(false),
                stops: AtomicUsize::new(0),
                moves: Mutex::new(Vec::new()),
            })
        }

        fn failing(error: NavError) -> Arc<Self> {
            Arc::new(Self {
                motion_time: Duration::ZERO,
                fail_with: Some(error),
                stopped: AtomicBool::new(false),
                stops: AtomicUsize::new(0),
                moves: Mutex::new(Vec::new()),
            })
        }

        fn act(&self, name: &str, magnitude: Option<f64>) -> Result<(), NavError> {
            self.moves.lock().unwrap().push(format!("{name} {magnitude:?}"));
            self.stopped.store(false, Ordering::SeqCst);
            let deadline = std::time::Instant::now() + self.motion_time;
            while std::time::Instant::now() < deadline {
                if self.stopped.load(Ordering::SeqCst) {
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            match &self.fail_with {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }

        fn stops(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }
    }

    impl RobotActuator for CountingRobot {
        fn move_forward(&self, distance: Option<f64>) -> Result<(), NavError> {
            self.act("forward", distance)
        }

        fn move_backward(&self, distance: Option<f64>) -> Result<(), NavError> {
            self.act("backward", distance)
        }

        fn rotate_left(&self, angle: Option<f64>) -> Result<(), NavError> {
            self.act("left", angle)
        }

        fn rotate_right(&self, angle: Option<f64>) -> Result<(), NavError> {
            self.act("right", angle)
        }

        fn stop(&self) -> Result<(), NavError> {
            self.stopped.store(true, Ordering::SeqCst);
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn camera_image(&self) -> Result<CameraFrame, NavError> {
            Ok(CameraFrame::new(1, 1, vec![0; 3]))
        }

        fn front_range_readings(&self, fov_degrees: f64) -> Result<LidarSnapshot, NavError> {
            Ok(LidarSnapshot::new(vec![1.5; 3], fov_degrees))
        }
    }

    fn sweep(readings: &[f64]) -> LidarSnapshot {
        LidarSnapshot::new(readings.to_vec(), 90.0)
    }

    #[test]
    fn forward_beyond_nearest_reading_is_unsafe() {
        let executor = ActionExecutor::new(CountingRobot::new(Duration::ZERO), Duration::from_secs(1));
        assert!(!executor.check_safety(&RobotAction::new(Command::Front, 2.0), &sweep(&[1.5, 1.5, 1.5])));
        assert!(executor.check_safety(&RobotAction::new(Command::Front, 1.0), &sweep(&[1.5, 1.5, 1.5])));
    }

    #[test]
    fn rotation_is_never_blocked() {
        let executor = ActionExecutor::new(CountingRobot::new(Duration::ZERO), Duration::from_secs(1));
        assert!(executor.check_safety(&RobotAction::new(Command::RotateLeft, 90.0), &sweep(&[0.1])));
        assert!(executor.check_safety(&RobotAction::new(Command::Back, 5.0), &sweep(&[0.1])));
    }

    #[test]
    fn empty_sweep_is_safe() {
        let executor = ActionExecutor::new(CountingRobot::new(Duration::ZERO), Duration::from_secs(1));
        assert!(executor.check_safety(&RobotAction::new(Command::Front, 3.0), &sweep(&[])));
    }

    #[test]
    fn verify_reports_nearest_distance() {
        let executor = ActionExecutor::new(CountingRobot::new(Duration::ZERO), Duration::from_secs(1));
        let err = executor
            .verify(&RobotAction::new(Command::Front, 1.0), &sweep(&[2.0, 0.4, 3.0]))
            .unwrap_err();
        assert!(matches!(err, NavError::ObstacleDetected { distance } if distance == 0.4));
    }

    #[test]
    fn every_motion_command_has_a_handler() {
        for command in Command::KNOWN {
            assert_eq!(motion_for(&command).is_some(), command.is_motion(), "{command}");
        }
        assert!(motion_for(&Command::Unknown("JUMP".into())).is_none());
    }

    #[tokio::test]
    async fn success_stops_exactly_once() {
        let robot = CountingRobot::new(Duration::ZERO);
        let executor = ActionExecutor::new(robot.clone(), Duration::from_secs(5));
        let result = executor.execute(&RobotAction::new(Command::RotateRight, 45.0)).await;
        assert_eq!(result.status, ActionStatus::Success);
        assert_eq!(robot.stops(), 1);
        assert_eq!(*robot.moves.lock().unwrap(), vec!["right Some(45.0)"]);
    }

    #[tokio::test]
    async fn unknown_command_fails_and_stops() {
        let robot = CountingRobot::new(Duration::ZERO);
        let executor = ActionExecutor::new(robot.clone(), Duration::from_secs(5));
        let result = executor.execute(&RobotAction::new("JUMP", 1.0)).await;
        assert_eq!(result, ActionResult::failure("Unknown command"));
        assert_eq!(robot.stops(), 1);
        assert!(robot.moves.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn device_error_is_failure() {
        let robot = CountingRobot::failing(NavError::HardwareFault {
            component: "left_wheel".into(),
            details: "stalled".into(),
        });
        let executor = ActionExecutor::new(robot.clone(), Duration::from_secs(5));
        let result = executor.execute(&RobotAction::new(Command::Back, 0.2)).await;
        assert_eq!(result.status, ActionStatus::Failure);
        assert!(result.message.contains("stalled"));
        assert_eq!(robot.stops(), 1);
    }

    #[tokio::test]
    async fn obstacle_error_maps_to_obstacle_status() {
        let robot = CountingRobot::failing(NavError::ObstacleDetected { distance: 0.12 });
        let executor = ActionExecutor::new(robot.clone(), Duration::from_secs(5));
        let result = executor.execute(&RobotAction::new(Command::Front, 1.0)).await;
        assert_eq!(result.status, ActionStatus::ObstacleDetected);
        assert_eq!(robot.stops(), 1);
    }

    #[tokio::test]
    async fn timeout_aborts_and_stops() {
        let robot = CountingRobot::new(Duration::from_secs(10));
        let executor = ActionExecutor::new(robot.clone(), Duration::from_millis(50));
        let started = std::time::Instant::now();
        let result = executor.execute(&RobotAction::new(Command::Front, 1.0)).await;
        assert_eq!(result.status, ActionStatus::Aborted);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(robot.stops(), 1);
    }
}
