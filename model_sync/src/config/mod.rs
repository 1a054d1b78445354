use std::{
    fs,
    net::SocketAddr,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, SyncErr},
    merge::GradientClip,
};

/// The specification for the `MergeFunction` used to fold updates into the canonical buffer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeFnSpec {
    /// `canonical = epoch base + mean of the updates merged during the epoch`.
    Average,
    /// `canonical += update`, for updates already scaled by the caller.
    GlobalSum,
    /// Bias-corrected adaptive step over raw gradients.
    AdaptiveGradient { beta1: f32, beta2: f32, epsilon: f32 },
}

impl Default for MergeFnSpec {
    fn default() -> Self {
        Self::AdaptiveGradient {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl MergeFnSpec {
    /// Whether the merge function expects raw gradients instead of ready-made updates.
    ///
    /// `Average` and `GlobalSum` add whatever they receive to the parameters, so workers
    /// must send `-learning_rate * gradient` to them. `AdaptiveGradient` computes the step
    /// itself from the raw gradient and the learning rate of the call.
    pub fn consumes_gradient(&self) -> bool {
        matches!(self, Self::AdaptiveGradient { .. })
    }
}

/// Multi-process layout of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Total amount of cooperating processes.
    pub num_procs: usize,
    /// This process's rank, in `0..num_procs`.
    pub rank: usize,
    /// Address the coordinator listens on and the other ranks connect to.
    pub coordinator_addr: SocketAddr,
    #[serde(default)]
    pub coordinator_rank: usize,
    /// Whether the coordinator sends its parameters to every rank at startup.
    #[serde(default = "default_true")]
    pub broadcast_initial: bool,
    /// Whether every rank hands its final parameters to the coordinator at shutdown.
    #[serde(default = "default_true")]
    pub collect_final: bool,
    #[serde(default = "default_exchange_timeout_ms")]
    pub exchange_timeout_ms: u64,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// How long the coordinator waits at shutdown for the other ranks to finish and hand in
    /// their final parameters.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl ClusterConfig {
    pub fn is_coordinator(&self) -> bool {
        self.rank == self.coordinator_rank
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Options of the parallel training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Number of worker threads (one per device).
    #[serde(default = "default_num_threads")]
    pub num_threads: NonZeroUsize,
    /// Serialize every merge behind the parameter lock. When off, shards are locked
    /// independently and merges from different workers may interleave.
    #[serde(default = "default_true")]
    pub asgd_lock: bool,
    #[serde(default)]
    pub merge_fn: MergeFnSpec,
    /// Processed samples between two cross-process exchanges.
    #[serde(default = "default_merge_size")]
    pub merge_size: NonZeroUsize,
    /// Maximum amount of parameters per shard, the whole buffer is one shard when absent.
    #[serde(default)]
    pub shard_size: Option<NonZeroUsize>,
    #[serde(default)]
    pub clip: Option<GradientClip>,
    /// Destination for synchronization events, suffixed with the rank.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Absent for single-process deployments.
    #[serde(default)]
    pub cluster: Option<ClusterConfig>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            num_threads: default_num_threads(),
            asgd_lock: true,
            merge_fn: MergeFnSpec::default(),
            merge_size: default_merge_size(),
            shard_size: None,
            clip: None,
            log_file: None,
            cluster: None,
        }
    }
}

impl ParallelConfig {
    /// Parses and validates a configuration from a JSON document.
    ///
    /// # Arguments
    /// * `json` - The JSON document.
    ///
    /// # Returns
    /// The configuration or an `InvalidConfig` error.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a configuration file.
    ///
    /// # Arguments
    /// * `path` - Path to a JSON file.
    ///
    /// # Returns
    /// The configuration or an `InvalidConfig` error.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            SyncErr::InvalidConfig(format!("cannot read '{}': {e}", path.display()))
        })?;

        Self::from_json_str(&content)
    }

    /// The rank of this process, `0` when running a single process.
    pub fn rank(&self) -> usize {
        self.cluster.as_ref().map_or(0, |c| c.rank)
    }

    /// Checks the cross-field constraints of the configuration.
    ///
    /// # Returns
    /// An `InvalidConfig` error describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SyncErr::InvalidConfig(msg));

        if let MergeFnSpec::AdaptiveGradient {
            beta1,
            beta2,
            epsilon,
        } = self.merge_fn
        {
            if !(0.0..1.0).contains(&beta1) || !(0.0..1.0).contains(&beta2) {
                return invalid(format!(
                    "adaptive gradient betas must be in [0, 1), got {beta1} and {beta2}"
                ));
            }
            if epsilon <= 0.0 {
                return invalid(format!("epsilon must be positive, got {epsilon}"));
            }
        }

        if let Some(clip) = self.clip {
            let threshold = clip.threshold();
            if !(threshold.is_finite() && threshold > 0.0) {
                return invalid(format!("clip threshold must be positive, got {threshold}"));
            }
        }

        let Some(cluster) = &self.cluster else {
            return Ok(());
        };

        if cluster.num_procs == 0 {
            return invalid("num_procs must be at least 1".into());
        }
        if cluster.rank >= cluster.num_procs {
            return invalid(format!(
                "rank {} is out of range for {} processes",
                cluster.rank, cluster.num_procs
            ));
        }
        if cluster.coordinator_rank >= cluster.num_procs {
            return invalid(format!(
                "coordinator rank {} is out of range for {} processes",
                cluster.coordinator_rank, cluster.num_procs
            ));
        }
        if [
            cluster.exchange_timeout_ms,
            cluster.startup_timeout_ms,
            cluster.shutdown_timeout_ms,
        ]
        .contains(&0)
        {
            return invalid("timeouts must be greater than zero".into());
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_num_threads() -> NonZeroUsize {
    NonZeroUsize::MIN
}

fn default_merge_size() -> NonZeroUsize {
    NonZeroUsize::new(400_000).unwrap_or(NonZeroUsize::MIN)
}

fn default_exchange_timeout_ms() -> u64 {
    5_000
}

fn default_startup_timeout_ms() -> u64 {
    30_000
}

fn default_shutdown_timeout_ms() -> u64 {
    600_000
}
