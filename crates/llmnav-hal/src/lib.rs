//! Hardware abstraction for the navigation loop.
//!
//! The control loop only talks to [`RobotActuator`]; the concrete robot can
//! be a real driver or the in-process [`sim::SimRobot`].

pub mod actuator;
pub mod camera;
pub mod lidar;
pub mod sim;

pub use actuator::{RobotActuator, validate_magnitude};
pub use camera::{CameraFrame, jpeg_data_uri};
pub use lidar::LidarSnapshot;
pub use sim::{Obstacle, SimConfig, SimRobot};
