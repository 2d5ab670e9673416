//! Node configuration – read from `./rangefuse.toml` by default.

use rangefuse_perception::transform::{Quaternion, Vec3};
use rangefuse_perception::fuser::MIN_CONE_STEP_RAD;
use rangefuse_perception::{ConeStrategy, MergePolicy, ScanFuser, SensorDescriptor, TfEngine, Transform3D};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Env var naming an alternative config file.
pub const CONFIG_ENV: &str = "RANGEFUSE_CONFIG";

const DEFAULT_CONFIG_FILE: &str = "rangefuse.toml";

/// Top-level configuration of the fusion node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Topic carrying the primary scanner's scans.
    #[serde(default = "default_input_topic")]
    pub input_topic: String,

    /// Topic the fused scans are published on.
    #[serde(default = "default_output_topic")]
    pub output_topic: String,

    #[serde(default)]
    pub fusion: FusionConfig,

    #[serde(default)]
    pub sensors: Vec<SensorConfig>,

    /// Static mounting transforms loaded into the frame tree at startup.
    #[serde(default)]
    pub transforms: Vec<TransformConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub cone: ConeStrategy,
    pub skeleton_policy: MergePolicy,
    pub sensor_policy: MergePolicy,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            cone: ConeStrategy::CentralRayOnly,
            skeleton_policy: MergePolicy::RawOverwrite,
            sensor_policy: MergePolicy::ClosestWins,
        }
    }
}

/// One auxiliary range sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub topic: String,
    pub frame_id: String,
    pub range_min: f32,
    pub range_max: f32,
    /// Half-angle of the sensor cone, radians.
    #[serde(default)]
    pub field_of_view: f32,
}

/// A fixed parent → child transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformConfig {
    pub parent: String,
    pub child: String,
    #[serde(default)]
    pub translation: [f32; 3],
    /// Rotation about z, radians.  Ignored when `rotation` is given.
    #[serde(default)]
    pub yaw: f32,
    /// Full rotation quaternion as `[w, x, y, z]`, normalised on load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<[f32; 4]>,
}

impl TransformConfig {
    pub fn to_transform(&self) -> Transform3D {
        let rotation = match self.rotation {
            Some(q) => Quaternion::from(q).normalized(),
            None => Quaternion::from_yaw(self.yaw),
        };
        Transform3D::new(Vec3::from(self.translation), rotation)
    }
}

fn default_input_topic() -> String {
    "scan".to_string()
}
fn default_output_topic() -> String {
    "scan_fused".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_topic: default_input_topic(),
            output_topic: default_output_topic(),
            fusion: FusionConfig::default(),
            sensors: Vec::new(),
            transforms: Vec::new(),
        }
    }
}

impl Config {
    /// Parse TOML text without applying environment overrides.
    pub fn from_toml_str(raw: &str) -> Result<Self, String> {
        toml::from_str(raw).map_err(|e| format!("Failed to parse config: {}", e))
    }

    /// Check the loaded values before any node is built.
    pub fn validate(&self) -> Result<(), String> {
        if self.input_topic.is_empty() || self.output_topic.is_empty() {
            return Err("input_topic and output_topic must not be empty".to_string());
        }
        if let ConeStrategy::FullCone { step_rad } = self.fusion.cone
            && !(step_rad >= MIN_CONE_STEP_RAD && step_rad.is_finite())
        {
            return Err(format!(
                "fusion.cone.step_rad must be at least {MIN_CONE_STEP_RAD}, got {step_rad}"
            ));
        }
        for sensor in &self.sensors {
            if sensor.topic.is_empty() || sensor.frame_id.is_empty() {
                return Err("every sensor needs a topic and a frame_id".to_string());
            }
            if sensor.range_min > sensor.range_max {
                return Err(format!(
                    "sensor {}: range_min {} exceeds range_max {}",
                    sensor.topic, sensor.range_min, sensor.range_max
                ));
            }
        }
        for t in &self.transforms {
            if t.parent.is_empty() || t.child.is_empty() {
                return Err("every transform needs a parent and a child frame".to_string());
            }
            if let Some(q) = t.rotation {
                let norm_sq: f32 = q.iter().map(|c| c * c).sum();
                if !(norm_sq.is_finite() && norm_sq > f32::EPSILON) {
                    return Err(format!(
                        "transform {} -> {}: rotation {q:?} is not a usable quaternion",
                        t.parent, t.child
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn fuser(&self) -> ScanFuser {
        ScanFuser::new(
            self.fusion.cone,
            self.fusion.skeleton_policy,
            self.fusion.sensor_policy,
        )
    }

    /// Fresh descriptors for every configured sensor, in file order.
    pub fn sensor_descriptors(&self) -> Vec<SensorDescriptor> {
        self.sensors
            .iter()
            .map(|s| SensorDescriptor::new(&s.topic, &s.frame_id, s.range_min, s.range_max, s.field_of_view))
            .collect()
    }

    /// A frame tree holding every configured static transform.
    pub fn frame_tree(&self) -> TfEngine {
        let mut tf = TfEngine::new();
        for t in &self.transforms {
            tf.set_static_transform(&t.parent, &t.child, t.to_transform());
        }
        tf
    }
}

/// Resolve the config path: explicit argument, then `RANGEFUSE_CONFIG`, then
/// `./rangefuse.toml`.
pub fn config_path(arg: Option<String>) -> PathBuf {
    arg.or_else(|| std::env::var(CONFIG_ENV).ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Load the config from `path`.  Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg = Config::from_toml_str(&raw)?;
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(Some(cfg))
}

/// Apply `RANGEFUSE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `RANGEFUSE_INPUT_TOPIC` | `input_topic` |
/// | `RANGEFUSE_OUTPUT_TOPIC` | `output_topic` |
/// | `RANGEFUSE_CONE_STEP` | `fusion.cone` (switches to the full cone) |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("RANGEFUSE_INPUT_TOPIC") {
        cfg.input_topic = v;
    }
    if let Ok(v) = std::env::var("RANGEFUSE_OUTPUT_TOPIC") {
        cfg.output_topic = v;
    }
    if let Ok(v) = std::env::var("RANGEFUSE_CONE_STEP")
        && let Ok(step_rad) = v.parse::<f32>()
        && step_rad >= MIN_CONE_STEP_RAD
    {
        cfg.fusion.cone = ConeStrategy::FullCone { step_rad };
    }
}
