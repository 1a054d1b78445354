use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use model_sync::{ParallelConfig, Result, SyncErr};
use serde::{Deserialize, Serialize};

/// Settings of the synthetic training run driven by a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Input size of the linear model.
    #[serde(default = "default_features")]
    pub features: usize,
    /// Samples every worker thread processes before stopping.
    #[serde(default = "default_samples_per_worker")]
    pub samples_per_worker: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: NonZeroUsize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    /// A prediction this close to its target counts as correct.
    #[serde(default = "default_tolerance")]
    pub tolerance: f32,
    #[serde(default = "default_noise")]
    pub noise: f32,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Where the final parameters are written, suffixed with the rank.
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            features: default_features(),
            samples_per_worker: default_samples_per_worker(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            tolerance: default_tolerance(),
            noise: default_noise(),
            seed: default_seed(),
            checkpoint: None,
        }
    }
}

/// The configuration document of a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub sync: ParallelConfig,
    #[serde(default)]
    pub training: TrainingConfig,
}

impl NodeConfig {
    /// Parses a configuration document, applies the rank override and validates it.
    ///
    /// # Arguments
    /// * `json` - The JSON document.
    /// * `rank` - The value of the `RANK` environment variable, if set.
    pub fn from_json_str(json: &str, rank: Option<&str>) -> Result<Self> {
        let mut config: Self = serde_json::from_str(json)?;
        config.override_rank(rank)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a configuration file, a missing path means every default.
    pub fn load(path: Option<&Path>, rank: Option<&str>) -> Result<Self> {
        let Some(path) = path else {
            let mut config = Self::default();
            config.override_rank(rank)?;
            config.validate()?;
            return Ok(config);
        };

        let content = fs::read_to_string(path).map_err(|e| {
            SyncErr::InvalidConfig(format!("cannot read '{}': {e}", path.display()))
        })?;

        Self::from_json_str(&content, rank)
    }

    fn override_rank(&mut self, rank: Option<&str>) -> Result<()> {
        let Some(rank) = rank else {
            return Ok(());
        };

        let Some(cluster) = self.sync.cluster.as_mut() else {
            return Err(SyncErr::InvalidConfig(
                "RANK is set but no cluster is configured".into(),
            ));
        };

        cluster.rank = rank
            .trim()
            .parse()
            .map_err(|e| SyncErr::InvalidConfig(format!("invalid RANK '{rank}': {e}")))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.sync.validate()?;

        let training = &self.training;
        if training.features == 0 {
            return Err(SyncErr::InvalidConfig("features must be at least 1".into()));
        }
        if !(training.learning_rate.is_finite() && training.learning_rate > 0.) {
            return Err(SyncErr::InvalidConfig(format!(
                "learning rate must be positive, got {}",
                training.learning_rate
            )));
        }

        Ok(())
    }
}

fn default_features() -> usize {
    8
}

fn default_samples_per_worker() -> usize {
    20_000
}

fn default_batch_size() -> NonZeroUsize {
    NonZeroUsize::new(32).unwrap_or(NonZeroUsize::MIN)
}

fn default_learning_rate() -> f32 {
    0.01
}

fn default_tolerance() -> f32 {
    0.1
}

fn default_noise() -> f32 {
    0.01
}

fn default_seed() -> u64 {
    42
}
