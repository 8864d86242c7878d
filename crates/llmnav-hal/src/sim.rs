//! In-process simulated robot for headless runs and tests.
//!
//! [`SimRobot`] is a kinematic differential-drive base with the wheel
//! geometry of a small research robot, a forward ray-cast LIDAR and a
//! synthetic camera. Obstacles are circles on a flat floor. Motion is
//! integrated at a fixed time step; with `real_time` disabled the simulated
//! clock runs as fast as the CPU allows, which is what the tests use.
//!
//! # Example
//!
//! ```rust
//! use llmnav_hal::{Obstacle, RobotActuator, SimConfig, SimRobot};
//!
//! let robot = SimRobot::new(SimConfig::default().with_obstacle(Obstacle::new(2.0, 0.0, 0.2)));
//! robot.move_forward(Some(0.5)).expect("path is clear");
//! let sweep = robot.front_range_readings(90.0).expect("fov within sensor range");
//! assert!(sweep.min_distance().unwrap() < 1.5);
//! ```

use std::f64::consts::PI;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use llmnav_types::{NavError, RobotPose};
use tracing::{debug, trace};

use crate::actuator::{RobotActuator, validate_magnitude};
use crate::camera::CameraFrame;
use crate::lidar::LidarSnapshot;

/// Wheel radius in meters.
pub const WHEEL_RADIUS: f64 = 0.021;
/// Distance from the robot centre to each wheel in meters.
pub const CENTER_TO_WHEEL: f64 = 0.0527;
/// Nominal wheel speed in rad/s.
pub const MAX_WHEEL_SPEED: f64 = 47.6 / 3.0;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// A circular obstacle in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Obstacle {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
}

impl Obstacle {
    pub fn new(x: f64, y: f64, radius: f64) -> Self {
        Self { x, y, radius }
    }
}

/// Parameters of the simulated world and robot.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Integration step of the simulated clock.
    pub time_step: Duration,
    /// Sleep for `time_step` after every step so motion takes wall-clock time.
    pub real_time: bool,
    /// Forward speed in m/s.
    pub linear_speed: f64,
    /// Turn rate in rad/s.
    pub angular_speed: f64,
    pub robot_radius: f64,
    /// Minimum clearance kept in front of the robot during forward motion.
    pub collision_margin: f64,
    pub lidar_fov_degrees: f64,
    pub lidar_resolution: usize,
    pub lidar_max_range: f64,
    pub camera_width: u32,
    pub camera_height: u32,
    pub camera_fov_degrees: f64,
    pub initial_pose: RobotPose,
    pub obstacles: Vec<Obstacle>,
}

impl Default for SimConfig {
    fn default() -> Self {
        let linear_speed = WHEEL_RADIUS * MAX_WHEEL_SPEED;
        Self {
            time_step: Duration::from_millis(32),
            real_time: false,
            linear_speed,
            angular_speed: linear_speed / CENTER_TO_WHEEL,
            robot_radius: 0.07,
            collision_margin: 0.05,
            lidar_fov_degrees: 240.0,
            lidar_resolution: 241,
            lidar_max_range: 4.0,
            camera_width: 64,
            camera_height: 48,
            camera_fov_degrees: 60.0,
            initial_pose: RobotPose {
                x: 0.0,
                y: 0.0,
                heading: 0.0,
            },
            obstacles: Vec::new(),
        }
    }
}

impl SimConfig {
    pub fn with_obstacle(mut self, obstacle: Obstacle) -> Self {
        self.obstacles.push(obstacle);
        self
    }

    pub fn with_pose(mut self, pose: RobotPose) -> Self {
        self.initial_pose = pose;
        self
    }

    pub fn real_time(mut self, enabled: bool) -> Self {
        self.real_time = enabled;
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimRobot
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct SimState {
    pose: RobotPose,
    /// Teleoperation velocities applied by [`SimRobot::step`].
    linear: f64,
    angular: f64,
    elapsed: Duration,
}

/// Simulated differential-drive robot.
///
/// Every motion call takes a fresh motion ticket; `stop` invalidates the
/// current ticket, so a bounded motion running on another thread ends at
/// its next step.
#[derive(Debug)]
pub struct SimRobot {
    config: SimConfig,
    state: Mutex<SimState>,
    motion: AtomicU64,
}

impl SimRobot {
    pub fn new(config: SimConfig) -> Self {
        let state = SimState {
            pose: config.initial_pose,
            linear: 0.0,
            angular: 0.0,
            elapsed: Duration::ZERO,
        };
        Self {
            config,
            state: Mutex::new(state),
            motion: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Simulated time elapsed since construction.
    pub fn elapsed(&self) -> Duration {
        self.state().elapsed
    }

    /// Teleport the robot. Any teleoperation velocity is cleared.
    pub fn set_pose(&self, pose: RobotPose) {
        let mut state = self.state();
        state.pose = pose;
        state.linear = 0.0;
        state.angular = 0.0;
    }

    /// Advance the simulated clock by one time step, applying the current
    /// teleoperation velocities.
    pub fn step(&self) {
        let dt = self.config.time_step.as_secs_f64();
        let mut state = self.state();
        let delta = state.linear * dt;
        let turn = state.angular * dt;
        if delta > 0.0 && self.forward_clearance(&state.pose) - delta < self.config.collision_margin {
            debug!("teleop motion blocked by obstacle, halting");
            state.linear = 0.0;
            state.angular = 0.0;
        } else {
            translate(&mut state.pose, delta);
            rotate(&mut state.pose, turn);
        }
        state.elapsed += self.config.time_step;
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_motion(&self) -> u64 {
        self.motion.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, ticket: u64) -> bool {
        self.motion.load(Ordering::SeqCst) == ticket
    }

    fn pace(&self) {
        if self.config.real_time {
            std::thread::sleep(self.config.time_step);
        }
    }

    fn interrupted() -> NavError {
        NavError::HardwareFault {
            component: "drive".to_string(),
            details: "motion interrupted by stop".to_string(),
        }
    }

    /// Free distance the robot body can travel along its heading.
    fn forward_clearance(&self, pose: &RobotPose) -> f64 {
        self.config
            .obstacles
            .iter()
            .filter_map(|o| {
                ray_circle(pose.x, pose.y, pose.heading, o, self.config.robot_radius)
            })
            .fold(f64::INFINITY, f64::min)
    }

    /// Distance along `theta` from the robot centre to the nearest obstacle.
    fn cast(&self, pose: &RobotPose, theta: f64) -> Option<(usize, f64)> {
        self.config
            .obstacles
            .iter()
            .enumerate()
            .filter_map(|(i, o)| ray_circle(pose.x, pose.y, theta, o, 0.0).map(|d| (i, d)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    fn drive(&self, direction: f64, distance: Option<f64>) -> Result<(), NavError> {
        let distance = validate_magnitude(distance)?;
        let ticket = self.begin_motion();

        let Some(distance) = distance else {
            let mut state = self.state();
            state.linear = direction * self.config.linear_speed;
            state.angular = 0.0;
            return Ok(());
        };

        {
            let mut state = self.state();
            state.linear = 0.0;
            state.angular = 0.0;
        }

        let step_len = self.config.linear_speed * self.config.time_step.as_secs_f64();
        let mut remaining = distance;
        while remaining > 0.0 {
            if !self.is_current(ticket) {
                return Err(Self::interrupted());
            }
            let delta = remaining.min(step_len);
            {
                let mut state = self.state();
                if direction > 0.0 {
                    let clearance = self.forward_clearance(&state.pose);
                    if clearance - delta < self.config.collision_margin {
                        debug!(clearance, "obstacle ahead, stopping forward motion");
                        return Err(NavError::ObstacleDetected {
                            distance: clearance,
                        });
                    }
                }
                translate(&mut state.pose, direction * delta);
                state.elapsed += self.config.time_step;
            }
            remaining -= delta;
            self.pace();
        }
        trace!(distance, direction, "drive finished");
        Ok(())
    }

    fn turn(&self, direction: f64, angle_degrees: Option<f64>) -> Result<(), NavError> {
        let angle = validate_magnitude(angle_degrees)?;
        let ticket = self.begin_motion();

        let Some(angle) = angle else {
            let mut state = self.state();
            state.linear = 0.0;
            state.angular = direction * self.config.angular_speed;
            return Ok(());
        };

        {
            let mut state = self.state();
            state.linear = 0.0;
            state.angular = 0.0;
        }

        let step_rad = self.config.angular_speed * self.config.time_step.as_secs_f64();
        let mut remaining = angle.to_radians();
        while remaining > 0.0 {
            if !self.is_current(ticket) {
                return Err(Self::interrupted());
            }
            let delta = remaining.min(step_rad);
            {
                let mut state = self.state();
                rotate(&mut state.pose, direction * delta);
                state.elapsed += self.config.time_step;
            }
            remaining -= delta;
            self.pace();
        }
        trace!(angle, direction, "turn finished");
        Ok(())
    }

    fn full_scan(&self, pose: &RobotPose) -> Vec<f64> {
        let n = self.config.lidar_resolution.max(1);
        let fov = self.config.lidar_fov_degrees;
        (0..n)
            .map(|i| {
                let bearing = if n == 1 {
                    0.0
                } else {
                    -fov / 2.0 + fov * i as f64 / (n - 1) as f64
                };
                // Negative bearings are on the left, i.e. counter-clockwise.
                let theta = pose.heading - bearing.to_radians();
                self.cast(pose, theta)
                    .map_or(self.config.lidar_max_range, |(_, d)| {
                        d.min(self.config.lidar_max_range)
                    })
            })
            .collect()
    }

    fn render(&self, pose: &RobotPose) -> CameraFrame {
        const SKY: [u8; 3] = [170, 200, 230];
        const FLOOR: [u8; 3] = [90, 90, 90];
        const PALETTE: [[u8; 3]; 4] = [[200, 120, 40], [60, 140, 200], [180, 60, 60], [80, 170, 90]];

        let w = self.config.camera_width;
        let h = self.config.camera_height;
        let fov = self.config.camera_fov_degrees;
        let horizon = h as f64 / 2.0;
        let mut data = Vec::with_capacity(w as usize * h as usize * 3);

        let columns: Vec<Option<(usize, f64)>> = (0..w)
            .map(|u| {
                let bearing = -fov / 2.0 + fov * (u as f64 + 0.5) / w as f64;
                self.cast(pose, pose.heading - bearing.to_radians())
                    .filter(|(_, d)| *d <= self.config.lidar_max_range)
            })
            .collect();

        for v in 0..h {
            for hit in &columns {
                let row = v as f64 + 0.5;
                let pixel = match hit {
                    Some((index, distance)) => {
                        let half = (h as f64 * 0.25 / distance.max(0.05)).min(horizon);
                        if (row - horizon).abs() <= half {
                            let shade = (1.0 / (1.0 + distance)).clamp(0.3, 1.0);
                            PALETTE[index % PALETTE.len()].map(|c| (c as f64 * shade) as u8)
                        } else if row < horizon {
                            SKY
                        } else {
                            FLOOR
                        }
                    }
                    None if row < horizon => SKY,
                    None => FLOOR,
                };
                data.extend_from_slice(&pixel);
            }
        }

        CameraFrame::new(w, h, data)
    }
}

impl RobotActuator for SimRobot {
    fn move_forward(&self, distance: Option<f64>) -> Result<(), NavError> {
        self.drive(1.0, distance)
    }

    fn move_backward(&self, distance: Option<f64>) -> Result<(), NavError> {
        self.drive(-1.0, distance)
    }

    fn rotate_left(&self, angle: Option<f64>) -> Result<(), NavError> {
        self.turn(1.0, angle)
    }

    fn rotate_right(&self, angle: Option<f64>) -> Result<(), NavError> {
        self.turn(-1.0, angle)
    }

    fn stop(&self) -> Result<(), NavError> {
        self.begin_motion();
        let mut state = self.state();
        state.linear = 0.0;
        state.angular = 0.0;
        Ok(())
    }

    fn camera_image(&self) -> Result<CameraFrame, NavError> {
        let pose = self.state().pose;
        Ok(self.render(&pose))
    }

    fn front_range_readings(&self, fov_degrees: f64) -> Result<LidarSnapshot, NavError> {
        let sensor_fov = self.config.lidar_fov_degrees;
        if !(fov_degrees > 0.0 && fov_degrees <= sensor_fov) {
            return Err(NavError::InvalidParameter(format!(
                "LIDAR field of view must be in (0, {sensor_fov}] degrees, got {fov_degrees}"
            )));
        }

        let pose = self.state().pose;
        let scan = self.full_scan(&pose);
        let n = scan.len();
        let count = (((n - 1) as f64 * fov_degrees / sensor_fov).round() as usize + 1).min(n);
        let start = ((n - 1) / 2).saturating_sub((count - 1) / 2);
        let end = (start + count).min(n);

        Ok(LidarSnapshot::new(scan[start..end].to_vec(), fov_degrees))
    }

    fn pose(&self) -> Option<RobotPose> {
        Some(self.state().pose)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Geometry helpers
// ────────────────────────────────────────────────────────────────────────────

fn translate(pose: &mut RobotPose, distance: f64) {
    pose.x += distance * pose.heading.cos();
    pose.y += distance * pose.heading.sin();
}

fn rotate(pose: &mut RobotPose, radians: f64) {
    pose.heading = normalize_angle(pose.heading + radians);
}

/// Wrap an angle into `(-PI, PI]`.
fn normalize_angle(mut angle: f64) -> f64 {
    while angle > PI {
        angle -= 2.0 * PI;
    }
    while angle <= -PI {
        angle += 2.0 * PI;
    }
    angle
}

/// Distance along the ray from `(x, y)` at angle `theta` to the obstacle
/// inflated by `inflate`. `Some(0.0)` when the origin is already inside.
fn ray_circle(x: f64, y: f64, theta: f64, obstacle: &Obstacle, inflate: f64) -> Option<f64> {
    let (dy, dx) = theta.sin_cos();
    let fx = x - obstacle.x;
    let fy = y - obstacle.y;
    let r = obstacle.radius + inflate;
    let b = fx * dx + fy * dy;
    let c = fx * fx + fy * fy - r * r;
    let disc = b * b - c;
    if disc < 0.0 {
        return None;
    }
    let sq = disc.sqrt();
    let near = -b - sq;
    let far = -b + sq;
    if near >= 0.0 {
        Some(near)
    } else if far >= 0.0 {
        Some(0.0)
    } else {
        None
    }
}
