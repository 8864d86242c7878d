//! Range-sensor snapshots.

/// One sweep of forward range readings.
///
/// Readings are ordered left to right: index `0` is at `-fov/2` degrees
/// (the robot's left) and the last index is at `+fov/2` (its right).
/// Distances are in meters; a reading equal to the sensor's maximum range
/// means nothing was hit.
#[derive(Debug, Clone, PartialEq)]
pub struct LidarSnapshot {
    pub readings: Vec<f64>,
    pub fov_degrees: f64,
}

impl LidarSnapshot {
    pub fn new(readings: Vec<f64>, fov_degrees: f64) -> Self {
        Self {
            readings,
            fov_degrees,
        }
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Smallest reading, or `None` for an empty sweep. NaN readings are
    /// ignored.
    pub fn min_distance(&self) -> Option<f64> {
        self.readings
            .iter()
            .copied()
            .filter(|d| !d.is_nan())
            .fold(None, |acc: Option<f64>, d| {
                Some(acc.map_or(d, |m| m.min(d)))
            })
    }

    /// Bearing in degrees of reading `index`, negative to the left.
    pub fn angle_of(&self, index: usize) -> f64 {
        let n = self.readings.len();
        if n <= 1 {
            return 0.0;
        }
        -self.fov_degrees / 2.0 + self.fov_degrees * index as f64 / (n - 1) as f64
    }
}
