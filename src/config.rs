//! Configuration for the ranking engine.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Artifact locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_path")]
    pub path: String,
    /// Calibration artifact; uncalibrated output when absent
    #[serde(default)]
    pub calibration_path: Option<String>,
}

fn default_model_path() -> String {
    "data/models/skills.json".to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: default_model_path(),
            calibration_path: None,
        }
    }
}

/// ListMLE optimizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_training_max_iterations")]
    pub max_iterations: usize,
    /// Stop when the absolute loss change drops below this
    #[serde(default = "default_training_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Ridge penalty on skills; keeps undefeated competitors finite
    #[serde(default = "default_l2_penalty")]
    pub l2_penalty: f64,
}

fn default_training_max_iterations() -> usize {
    200
}

fn default_training_tolerance() -> f64 {
    1e-6
}

fn default_learning_rate() -> f64 {
    0.05
}

fn default_l2_penalty() -> f64 {
    0.01
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_training_max_iterations(),
            tolerance: default_training_tolerance(),
            learning_rate: default_learning_rate(),
            l2_penalty: default_l2_penalty(),
        }
    }
}

/// Power EP settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Fractional power applied to each site update, in (0, 1]
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_inference_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_inference_tolerance")]
    pub tolerance: f64,
    /// Finishing positions that count as a place
    #[serde(default = "default_place_positions")]
    pub place_positions: usize,
}

fn default_alpha() -> f64 {
    0.5
}

fn default_inference_max_iterations() -> usize {
    300
}

fn default_inference_tolerance() -> f64 {
    1e-9
}

fn default_place_positions() -> usize {
    3
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            max_iterations: default_inference_max_iterations(),
            tolerance: default_inference_tolerance(),
            place_positions: default_place_positions(),
        }
    }
}

/// Calibration and quality-metric settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Equal-width bins for ECE/MCE
    #[serde(default = "default_n_bins")]
    pub n_bins: usize,
    /// Held-out ECE below this raises a leakage suspicion
    #[serde(default = "default_suspect_ece_threshold")]
    pub suspect_ece_threshold: f64,
    /// Sampled points kept from the risk-coverage curve
    #[serde(default = "default_rcc_points")]
    pub rcc_points: usize,
}

fn default_n_bins() -> usize {
    10
}

fn default_suspect_ece_threshold() -> f64 {
    0.01
}

fn default_rcc_points() -> usize {
    21
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            n_bins: default_n_bins(),
            suspect_ece_threshold: default_suspect_ece_threshold(),
            rcc_points: default_rcc_points(),
        }
    }
}

/// Coverage-fixed grading thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingConfig {
    /// Cumulative population share (percent) closing S, A, B and C.
    /// Everything after the last boundary is N.
    #[serde(default = "default_cumulative_percent")]
    pub cumulative_percent: [u32; 4],
}

fn default_cumulative_percent() -> [u32; 4] {
    [10, 25, 50, 80]
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            cumulative_percent: default_cumulative_percent(),
        }
    }
}

/// Immutable numeric configuration handed to every engine component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub grading: GradingConfig,
}

impl EngineConfig {
    /// Reject settings the numerical components cannot honor.
    pub fn validate(&self) -> Result<(), EngineError> {
        let alpha = self.inference.alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(EngineError::InvalidConfig(format!(
                "alpha must be in (0, 1], got {}",
                alpha
            )));
        }
        if self.inference.place_positions == 0 {
            return Err(EngineError::InvalidConfig(
                "place_positions must be at least 1".to_string(),
            ));
        }
        if self.training.max_iterations == 0 {
            return Err(EngineError::InvalidConfig(
                "training.max_iterations must be at least 1".to_string(),
            ));
        }
        if self.inference.max_iterations == 0 {
            return Err(EngineError::InvalidConfig(
                "inference.max_iterations must be at least 1".to_string(),
            ));
        }
        let tolerances = [self.training.tolerance, self.inference.tolerance];
        if tolerances.iter().any(|t| !(t.is_finite() && *t > 0.0)) {
            return Err(EngineError::InvalidConfig(format!(
                "tolerances must be positive, got training={} inference={}",
                self.training.tolerance, self.inference.tolerance
            )));
        }
        if self.training.learning_rate <= 0.0 || self.training.l2_penalty < 0.0 {
            return Err(EngineError::InvalidConfig(
                "learning_rate must be positive and l2_penalty non-negative".to_string(),
            ));
        }
        if self.calibration.n_bins == 0 || self.calibration.rcc_points < 2 {
            return Err(EngineError::InvalidConfig(
                "n_bins must be positive and rcc_points at least 2".to_string(),
            ));
        }
        let cuts = self.grading.cumulative_percent;
        let increasing = cuts.windows(2).all(|w| w[0] < w[1]);
        if !increasing || cuts[0] == 0 || cuts[3] > 100 {
            return Err(EngineError::InvalidConfig(format!(
                "grading thresholds must be strictly increasing within (0, 100], got {:?}",
                cuts
            )));
        }
        Ok(())
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl AppConfig {
    /// Load configuration from environment and config file
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with defaults
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // Add config file if exists
            .add_source(config::File::with_name("config").required(false))
            // Override with environment variables (KEIBA_ENGINE__INFERENCE__ALPHA, etc.)
            .add_source(
                config::Environment::with_prefix("KEIBA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app: AppConfig = config.try_deserialize()?;
        app.engine.validate()?;
        Ok(app)
    }
}
