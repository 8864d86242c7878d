//! Scene description: a short text digest of the range sensor injected into
//! every prompt.
//!
//! The sweep is split into three equal sectors (left, middle, right). Each
//! sector reports its nearest reading and the bearing at which it occurs.
//! The front distance is the mean of the six readings around the centre.

use std::fmt;

use llmnav_hal::LidarSnapshot;

/// Nearest reading inside one angular sector.
#[derive(Debug, Clone, PartialEq)]
pub struct Sector {
    pub min_angle: f64,
    pub max_angle: f64,
    pub min_distance: Option<f64>,
    pub min_distance_angle: Option<f64>,
}

impl Sector {
    fn from_readings(min_angle: f64, max_angle: f64, readings: &[f64]) -> Self {
        let nearest = readings
            .iter()
            .enumerate()
            .filter(|(_, d)| !d.is_nan())
            .min_by(|a, b| a.1.total_cmp(b.1));
        let span = readings.len().saturating_sub(1).max(1) as f64;
        Self {
            min_angle,
            max_angle,
            min_distance: nearest.map(|(_, d)| *d),
            min_distance_angle: nearest
                .map(|(i, _)| min_angle + (i as f64 / span) * (max_angle - min_angle)),
        }
    }
}

/// Sector digest of one LIDAR sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneDescription {
    pub front_distance: Option<f64>,
    pub left: Sector,
    pub middle: Sector,
    pub right: Sector,
}

impl SceneDescription {
    pub fn from_lidar(snapshot: &LidarSnapshot) -> Self {
        let readings = &snapshot.readings;
        let n = readings.len();
        let fov = snapshot.fov_degrees;
        let section = fov / 3.0;
        let left_end = n / 3;
        let middle_end = (2 * n) / 3;

        let front_distance = (n > 6).then(|| {
            let centre = &readings[n / 2 - 3..n / 2 + 3];
            centre.iter().sum::<f64>() / centre.len() as f64
        });

        Self {
            front_distance,
            left: Sector::from_readings(-fov / 2.0, -fov / 2.0 + section, &readings[..left_end]),
            middle: Sector::from_readings(
                -section / 2.0,
                section / 2.0,
                &readings[left_end..middle_end],
            ),
            right: Sector::from_readings(fov / 2.0 - section, fov / 2.0, &readings[middle_end..]),
        }
    }
}

fn distance(value: Option<f64>) -> String {
    value.map_or_else(|| "N/A".to_string(), |v| format!("{v:.2}"))
}

fn angle(value: Option<f64>) -> String {
    value.map_or_else(|| "N/A".to_string(), |v| format!("{}", v.round()))
}

impl fmt::Display for SceneDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Lidar distances:")?;
        writeln!(f, "  - Front: {}", distance(self.front_distance))?;
        for (name, sector) in [("Left", &self.left), ("Middle", &self.middle), ("Right", &self.right)] {
            writeln!(
                f,
                "  - {name} ([{}, {}] degrees): {} at angle {} degrees",
                sector.min_angle.round(),
                sector.max_angle.round(),
                distance(sector.min_distance),
                angle(sector.min_distance_angle),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sectors_split_sweep_in_thirds() {
        let mut readings = vec![3.0; 9];
        readings[1] = 0.5; // left
        readings[4] = 1.0; // middle
        readings[8] = 2.0; // right
        let scene = SceneDescription::from_lidar(&LidarSnapshot::new(readings, 90.0));

        assert_eq!(scene.left.min_distance, Some(0.5));
        assert_eq!(scene.middle.min_distance, Some(1.0));
        assert_eq!(scene.right.min_distance, Some(2.0));
        assert_eq!(scene.left.min_angle, -45.0);
        assert_eq!(scene.right.max_angle, 45.0);
        // Index 1 of 3 readings spanning [-45, -15].
        assert_eq!(scene.left.min_distance_angle, Some(-30.0));
    }

    #[test]
    fn front_distance_is_centre_mean() {
        let readings = vec![1.0, 1.0, 2.0, 2.0, 2.0, 4.0, 4.0, 4.0, 1.0, 1.0];
        let scene = SceneDescription::from_lidar(&LidarSnapshot::new(readings, 90.0));
        // Centre six readings: indices 2..8.
        assert_eq!(scene.front_distance, Some(3.0));
    }

    #[test]
    fn short_sweep_has_no_front_distance() {
        let scene = SceneDescription::from_lidar(&LidarSnapshot::new(vec![1.0; 6], 90.0));
        assert_eq!(scene.front_distance, None);
    }

    #[test]
    fn empty_sweep_renders_placeholders() {
        let scene = SceneDescription::from_lidar(&LidarSnapshot::new(Vec::new(), 90.0));
        let text = scene.to_string();
        assert!(text.contains("Front: N/A"));
        assert!(text.contains("Left ([-45, -15] degrees): N/A at angle N/A degrees"));
    }

    #[test]
    fn renders_distances_with_two_decimals() {
        let scene = SceneDescription::from_lidar(&LidarSnapshot::new(vec![1.23456; 9], 90.0));
        let text = scene.to_string();
        assert!(text.starts_with("Lidar distances:\n"));
        assert!(text.contains("Front: 1.23"));
        assert!(text.contains("Middle ([-15, 15] degrees): 1.23 at angle -15 degrees"));
    }
}
