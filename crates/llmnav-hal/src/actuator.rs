//! The `RobotActuator` trait: the only surface the control loop uses to move
//! the robot and read its sensors.
//!
//! Each motion primitive takes an optional magnitude. `Some(value)` means
//! "move this much, then stop" and the call returns once the motion is done.
//! `None` means teleoperation: start moving at nominal speed and return
//! immediately, leaving the robot in motion until [`RobotActuator::stop`].

use llmnav_types::{NavError, RobotPose};

use crate::camera::CameraFrame;
use crate::lidar::LidarSnapshot;

/// A mobile base with a forward-facing camera and range sensor.
///
/// Methods take `&self` so that one driver can be shared between the
/// control loop and the blocking worker that runs an action; implementations
/// use interior mutability.
pub trait RobotActuator: Send + Sync {
    /// Drive forward by `distance` meters.
    ///
    /// # Errors
    ///
    /// * [`NavError::InvalidParameter`] if `distance` is negative.
    /// * [`NavError::ObstacleDetected`] if the motion had to stop early.
    fn move_forward(&self, distance: Option<f64>) -> Result<(), NavError>;

    /// Drive backward by `distance` meters.
    fn move_backward(&self, distance: Option<f64>) -> Result<(), NavError>;

    /// Rotate counter-clockwise by `angle` degrees.
    fn rotate_left(&self, angle: Option<f64>) -> Result<(), NavError>;

    /// Rotate clockwise by `angle` degrees.
    fn rotate_right(&self, angle: Option<f64>) -> Result<(), NavError>;

    /// Stop all motion, including a motion in progress on another thread.
    fn stop(&self) -> Result<(), NavError>;

    /// Capture the current camera frame.
    fn camera_image(&self) -> Result<CameraFrame, NavError>;

    /// Range readings covering `fov_degrees` centred on the heading,
    /// ordered left to right.
    fn front_range_readings(&self, fov_degrees: f64) -> Result<LidarSnapshot, NavError>;

    /// Current pose, if the driver can observe it.
    fn pose(&self) -> Option<RobotPose> {
        None
    }
}

/// Check the magnitude precondition shared by every motion primitive.
///
/// # Errors
///
/// Returns [`NavError::InvalidParameter`] when `value` is negative or not a
/// finite number.
pub fn validate_magnitude(value: Option<f64>) -> Result<Option<f64>, NavError> {
    match value {
        Some(v) if !v.is_finite() => Err(NavError::InvalidParameter(format!(
            "magnitude must be a finite number, got {v}"
        ))),
        Some(v) if v < 0.0 => Err(NavError::InvalidParameter(format!(
            "magnitude must be non-negative, got {v}"
        ))),
        other => Ok(other),
    }
}
