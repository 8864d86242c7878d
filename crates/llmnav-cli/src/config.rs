//! Run configuration – `./llmnav.toml` plus `LLMNAV_*` overrides.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use llmnav_hal::{Obstacle, SimConfig};
use llmnav_runtime::{ControllerConfig, GatewayConfig, RateLimit};

/// Default config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "llmnav.toml";

/// Obstacle placed in the simulated arena.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObstacleConfig {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
}

/// Everything needed to run one session from the command line.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of an OpenAI-compatible server (Ollama, vLLM, OpenAI, ...).
    pub base_url: String,
    /// Model name sent with every request.
    pub model: String,
    /// Bearer token; empty for local servers.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    pub temperature: f32,

    pub max_iterations: usize,
    pub action_timeout_secs: f64,
    pub lidar_fov_degrees: f64,
    pub attach_camera: bool,
    pub max_consecutive_invalid: Option<usize>,
    pub max_consecutive_dangerous: Option<usize>,

    pub history_limit: usize,
    pub max_attempts: u32,
    pub retry_delay_secs: f64,
    /// Client-side request pacing; `0` disables it.
    pub rate_limit_period_secs: f64,
    pub rate_limit_burst: u32,
    /// Upper bound on one model call; `0` waits indefinitely.
    pub response_timeout_secs: f64,

    /// Where session traces are written; unset disables persistence.
    pub trace_dir: Option<PathBuf>,

    /// Pace the simulator at wall-clock speed.
    pub sim_real_time: bool,
    pub obstacles: Vec<ObstacleConfig>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field(
                "api_key",
                if self.api_key.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("temperature", &self.temperature)
            .field("max_iterations", &self.max_iterations)
            .field("action_timeout_secs", &self.action_timeout_secs)
            .field("lidar_fov_degrees", &self.lidar_fov_degrees)
            .field("attach_camera", &self.attach_camera)
            .field("max_consecutive_invalid", &self.max_consecutive_invalid)
            .field("max_consecutive_dangerous", &self.max_consecutive_dangerous)
            .field("history_limit", &self.history_limit)
            .field("max_attempts", &self.max_attempts)
            .field("retry_delay_secs", &self.retry_delay_secs)
            .field("rate_limit_period_secs", &self.rate_limit_period_secs)
            .field("rate_limit_burst", &self.rate_limit_burst)
            .field("response_timeout_secs", &self.response_timeout_secs)
            .field("trace_dir", &self.trace_dir)
            .field("sim_real_time", &self.sim_real_time)
            .field("obstacles", &self.obstacles.len())
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        let controller = ControllerConfig::default();
        let gateway = GatewayConfig::default();
        let rate = RateLimit::default();
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llava".to_string(),
            api_key: String::new(),
            temperature: 0.0,
            max_iterations: 20,
            action_timeout_secs: controller.action_timeout.as_secs_f64(),
            lidar_fov_degrees: controller.lidar_fov_degrees,
            attach_camera: controller.attach_camera,
            max_consecutive_invalid: controller.max_consecutive_invalid,
            max_consecutive_dangerous: controller.max_consecutive_dangerous,
            history_limit: gateway.history_limit,
            max_attempts: gateway.max_attempts,
            retry_delay_secs: gateway.retry_delay.as_secs_f64(),
            rate_limit_period_secs: rate.period.as_secs_f64(),
            rate_limit_burst: rate.burst,
            response_timeout_secs: gateway
                .response_timeout
                .map_or(0.0, |timeout| timeout.as_secs_f64()),
            trace_dir: Some(PathBuf::from("traces")),
            sim_real_time: false,
            obstacles: Vec::new(),
        }
    }
}

impl Config {
    pub fn controller_config(&self) -> Result<ControllerConfig, String> {
        Ok(ControllerConfig {
            action_timeout: seconds("action_timeout_secs", self.action_timeout_secs)?,
            lidar_fov_degrees: self.lidar_fov_degrees,
            attach_camera: self.attach_camera,
            max_consecutive_invalid: self.max_consecutive_invalid,
            max_consecutive_dangerous: self.max_consecutive_dangerous,
        })
    }

    pub fn gateway_config(&self) -> Result<GatewayConfig, String> {
        let rate_limit = if self.rate_limit_period_secs > 0.0 {
            Some(RateLimit {
                period: seconds("rate_limit_period_secs", self.rate_limit_period_secs)?,
                burst: self.rate_limit_burst,
            })
        } else {
            None
        };
        let response_timeout = if self.response_timeout_secs > 0.0 {
            Some(seconds("response_timeout_secs", self.response_timeout_secs)?)
        } else {
            None
        };
        Ok(GatewayConfig {
            history_limit: self.history_limit,
            max_attempts: self.max_attempts,
            retry_delay: seconds("retry_delay_secs", self.retry_delay_secs)?,
            rate_limit,
            response_timeout,
        })
    }

    pub fn sim_config(&self) -> SimConfig {
        self.obstacles.iter().fold(
            SimConfig::default().real_time(self.sim_real_time),
            |sim, o| sim.with_obstacle(Obstacle::new(o.x, o.y, o.radius)),
        )
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration, String> {
    Duration::try_from_secs_f64(value).map_err(|e| format!("Invalid {field} ({value}): {e}"))
}

/// Load the configuration.
///
/// An explicit `path` must exist. Without one, [`DEFAULT_CONFIG_PATH`] is
/// used when present and built-in defaults otherwise. Environment overrides
/// are applied last in every case.
pub fn load(path: Option<&Path>) -> Result<Config, String> {
    let mut cfg = match path {
        Some(path) => load_from(path)?
            .ok_or_else(|| format!("Config file not found: {}", path.display()))?,
        None => load_from(Path::new(DEFAULT_CONFIG_PATH))?.unwrap_or_default(),
    };
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Parse a config file. Returns `None` if the file does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `LLMNAV_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `LLMNAV_BASE_URL` | `base_url` |
/// | `LLMNAV_MODEL` | `model` |
/// | `LLMNAV_API_KEY` | `api_key` |
/// | `LLMNAV_TRACE_DIR` | `trace_dir` (empty disables traces) |
/// | `LLMNAV_MAX_ITERATIONS` | `max_iterations` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("LLMNAV_BASE_URL") {
        cfg.base_url = v;
    }
    if let Ok(v) = std::env::var("LLMNAV_MODEL") {
        cfg.model = v;
    }
    if let Ok(v) = std::env::var("LLMNAV_API_KEY") {
        cfg.api_key = v;
    }
    if let Ok(v) = std::env::var("LLMNAV_TRACE_DIR") {
        cfg.trace_dir = (!v.is_empty()).then(|| PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("LLMNAV_MAX_ITERATIONS")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.max_iterations = n;
    }
}
