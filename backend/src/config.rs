use engine_control_shared::{SensorLocation, SensorType, Stage};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_CONFIG_PATH: &str = "config/engine.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unknown stage {0:?} in stage list")]
    UnknownStage(String),
    #[error("stage {0} listed more than once")]
    DuplicateStage(Stage),
    #[error("stage {1} cannot follow stage {0}")]
    OutOfOrder(Stage, Stage),
    #[error("stage list is empty")]
    EmptyStageList,
    #[error("{0} must be positive")]
    NonPositive(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub stages: StagesConfig,
    #[serde(default)]
    pub tasks: TaskPeriods,
    #[serde(default)]
    pub sensors: Vec<SensorChannel>,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub sim: SimConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesConfig {
    pub list: Vec<String>,
    /// Seconds between repeated progression requests.
    pub request_interval: f64,
    /// Seconds between stage telemetry reports.
    pub send_interval: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TaskPeriods {
    pub control_period_ms: u64,
    pub sensor_period_ms: u64,
    pub actuation_period_ms: u64,
    pub telemetry_period_ms: u64,
}

impl Default for TaskPeriods {
    fn default() -> Self {
        Self {
            control_period_ms: 100,
            sensor_period_ms: 50,
            actuation_period_ms: 20,
            telemetry_period_ms: 250,
        }
    }
}

/// Linear calibration from raw device reading to engineering units.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SensorChannel {
    pub sensor_type: SensorType,
    pub location: SensorLocation,
    #[serde(default = "unit_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
}

fn unit_scale() -> f64 {
    1.0
}

impl SensorChannel {
    pub fn normalize(&self, measured: f64) -> f64 {
        measured * self.scale + self.offset
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:3000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SimConfig {
    pub valve_lag_ms: u64,
    /// Pressure gain per second while the pressurization valve is open.
    pub fill_rate_psi: f64,
    /// Pressure loss per second per open vent path.
    pub vent_rate_psi: f64,
    pub noise_psi: f64,
    pub ambient_psi: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            valve_lag_ms: 250,
            fill_rate_psi: 40.0,
            vent_rate_psi: 60.0,
            noise_psi: 0.5,
            ambient_psi: 14.7,
        }
    }
}

impl Config {
    /// Parses a config document and applies environment overrides before validating it.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_json::from_str(raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = std::env::var("EC_REQUEST_INTERVAL_SEC")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
        {
            self.stages.request_interval = v;
        }
        if let Some(v) = std::env::var("EC_SEND_INTERVAL_SEC")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
        {
            self.stages.send_interval = v;
        }
        if let Ok(addr) = std::env::var("EC_HTTP_ADDR") {
            self.http.addr = addr;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.stages.resolve()?;
        let periods = [
            (self.tasks.control_period_ms, "tasks.control_period_ms"),
            (self.tasks.sensor_period_ms, "tasks.sensor_period_ms"),
            (self.tasks.actuation_period_ms, "tasks.actuation_period_ms"),
            (self.tasks.telemetry_period_ms, "tasks.telemetry_period_ms"),
        ];
        for (period, name) in periods {
            if period == 0 {
                return Err(ConfigError::NonPositive(name));
            }
        }
        Ok(())
    }
}

impl StagesConfig {
    /// Maps configured names onto stages. Unknown names are rejected here so the
    /// sequencer never meets a stage it has no policy for.
    pub fn resolve(&self) -> Result<Vec<Stage>, ConfigError> {
        if self.list.is_empty() {
            return Err(ConfigError::EmptyStageList);
        }
        if self.request_interval.is_nan() || self.request_interval <= 0.0 {
            return Err(ConfigError::NonPositive("stages.request_interval"));
        }
        if self.send_interval.is_nan() || self.send_interval <= 0.0 {
            return Err(ConfigError::NonPositive("stages.send_interval"));
        }

        let mut seen = HashSet::new();
        let mut stages = Vec::with_capacity(self.list.len());
        for name in &self.list {
            let stage =
                Stage::from_name(name).ok_or_else(|| ConfigError::UnknownStage(name.clone()))?;
            if !seen.insert(stage) {
                return Err(ConfigError::DuplicateStage(stage));
            }
            stages.push(stage);
        }
        // configured stages must keep the physical order, gaps allowed
        for pair in stages.windows(2) {
            if stage_rank(pair[1]) <= stage_rank(pair[0]) {
                return Err(ConfigError::OutOfOrder(pair[0], pair[1]));
            }
        }
        Ok(stages)
    }
}

fn stage_rank(stage: Stage) -> usize {
    Stage::ALL
        .iter()
        .position(|s| *s == stage)
        .unwrap_or(Stage::ALL.len())
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("EC_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"{
        "stages": {
            "list": ["waiting", "pressurization", "autosequence", "postburn"],
            "request_interval": 5.0,
            "send_interval": 1.0
        }
    }"#;

    #[test]
    fn shipped_config_is_valid() {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH);
        let config = Config::load(&path).expect("shipped config should parse");
        let stages = config.stages.resolve().expect("stages");
        assert_eq!(stages.first(), Some(&Stage::Waiting));
        assert_eq!(stages.last(), Some(&Stage::Postburn));
        assert!(!config.sensors.is_empty());
    }

    #[test]
    fn missing_sections_take_defaults() {
        let config = Config::from_json(MINIMAL).expect("minimal config");
        assert_eq!(config.tasks.control_period_ms, 100);
        assert!(config.sensors.is_empty());
    }

    #[test]
    fn unknown_stage_is_rejected() {
        let raw = MINIMAL.replace("\"postburn\"", "\"coast\"");
        assert!(matches!(
            Config::from_json(&raw),
            Err(ConfigError::UnknownStage(name)) if name == "coast"
        ));
    }

    #[test]
    fn stages_must_keep_their_order() {
        let stages = StagesConfig {
            list: vec!["postburn".to_string(), "waiting".to_string()],
            request_interval: 1.0,
            send_interval: 1.0,
        };
        assert!(matches!(
            stages.resolve(),
            Err(ConfigError::OutOfOrder(Stage::Postburn, Stage::Waiting))
        ));

        let swapped = MINIMAL.replace(
            r#"["waiting", "pressurization", "autosequence", "postburn"]"#,
            r#"["waiting", "autosequence", "pressurization", "postburn"]"#,
        );
        assert!(matches!(
            Config::from_json(&swapped),
            Err(ConfigError::OutOfOrder(Stage::Autosequence, Stage::Pressurization))
        ));

        let skipping = StagesConfig {
            list: vec!["waiting".to_string(), "postburn".to_string()],
            request_interval: 1.0,
            send_interval: 1.0,
        };
        assert_eq!(
            skipping.resolve().expect("ordered subset"),
            [Stage::Waiting, Stage::Postburn]
        );
    }

    #[test]
    fn duplicate_and_empty_stage_lists_are_rejected() {
        let dup = MINIMAL.replace("\"postburn\"", "\"waiting\"");
        assert!(matches!(
            Config::from_json(&dup),
            Err(ConfigError::DuplicateStage(Stage::Waiting))
        ));

        let stages = StagesConfig {
            list: Vec::new(),
            request_interval: 1.0,
            send_interval: 1.0,
        };
        assert!(matches!(stages.resolve(), Err(ConfigError::EmptyStageList)));
    }

    #[test]
    fn non_positive_interval_is_rejected() {
        let stages = StagesConfig {
            list: vec!["waiting".to_string()],
            request_interval: 0.0,
            send_interval: 1.0,
        };
        assert!(matches!(
            stages.resolve(),
            Err(ConfigError::NonPositive("stages.request_interval"))
        ));
    }

    #[test]
    fn loads_from_a_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(MINIMAL.as_bytes()).expect("write");
        let config = Config::load(file.path()).expect("load");
        assert_eq!(config.stages.list.len(), 4);

        let missing = file.path().with_extension("missing");
        assert!(matches!(Config::load(&missing), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn calibration_is_linear() {
        let channel = SensorChannel {
            sensor_type: SensorType::Pressure,
            location: SensorLocation::PT2,
            scale: 2.0,
            offset: -1.0,
        };
        assert_eq!(channel.normalize(3.0), 5.0);
    }
}
