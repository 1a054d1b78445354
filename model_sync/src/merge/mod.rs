mod adaptive;
mod average;
mod clip;
mod global_sum;

pub use adaptive::AdaptiveGradient;
pub use average::Average;
pub use clip::GradientClip;
pub use global_sum::GlobalSum;

use crate::config::MergeFnSpec;

/// Per-call inputs of a merge, shared by every shard of one update.
#[derive(Debug, Clone, Copy)]
pub struct MergeCtx {
    pub learning_rate: f32,
    pub clip: Option<GradientClip>,
    /// Norm clipping factor, computed over the whole update.
    pub scale: f32,
}

impl MergeCtx {
    /// Creates the context for merging `update`.
    ///
    /// # Arguments
    /// * `update` - The complete incoming update.
    /// * `learning_rate` - The learning rate supplied by the training loop.
    /// * `clip` - Optional clipping to apply to `update`.
    pub fn new(update: &[f32], learning_rate: f32, clip: Option<GradientClip>) -> Self {
        let scale = clip.map_or(1., |clip| clip.scale_for(update));

        Self {
            learning_rate,
            clip,
            scale,
        }
    }

    /// Returns the element as the merge function must see it.
    #[inline]
    pub fn prepare(&self, g: f32) -> f32 {
        let g = g * self.scale;

        match self.clip {
            Some(clip) => clip.clamp(g),
            None => g,
        }
    }
}

/// Folds one worker's update into a slice of the canonical buffer.
pub trait MergeFunction {
    /// Merges `incoming` into `params`.
    ///
    /// # Arguments
    /// * `params` - The canonical parameters to update.
    /// * `incoming` - An update of the same length as `params`.
    /// * `ctx` - Per-call learning rate and clipping.
    fn merge(&mut self, params: &mut [f32], incoming: &[f32], ctx: &MergeCtx);

    /// Starts a new synchronization epoch from the current `params`.
    fn reset_epoch(&mut self, _params: &[f32]) {}
}

/// The closed set of merge functions, selected once at startup.
#[derive(Debug)]
pub enum MergeFn {
    Average(Average),
    GlobalSum(GlobalSum),
    AdaptiveGradient(AdaptiveGradient),
}

impl MergeFn {
    /// Builds the merge function described by `spec` for the given parameters.
    ///
    /// # Arguments
    /// * `spec` - The merge function specification.
    /// * `params` - The initial parameters the state is built for.
    pub fn from_spec(spec: MergeFnSpec, params: &[f32]) -> Self {
        match spec {
            MergeFnSpec::Average => Self::Average(Average::new(params)),
            MergeFnSpec::GlobalSum => Self::GlobalSum(GlobalSum),
            MergeFnSpec::AdaptiveGradient {
                beta1,
                beta2,
                epsilon,
            } => Self::AdaptiveGradient(AdaptiveGradient::new(params.len(), beta1, beta2, epsilon)),
        }
    }
}

impl MergeFunction for MergeFn {
    fn merge(&mut self, params: &mut [f32], incoming: &[f32], ctx: &MergeCtx) {
        match self {
            MergeFn::Average(f) => f.merge(params, incoming, ctx),
            MergeFn::GlobalSum(f) => f.merge(params, incoming, ctx),
            MergeFn::AdaptiveGradient(f) => f.merge(params, incoming, ctx),
        }
    }

    fn reset_epoch(&mut self, params: &[f32]) {
        match self {
            MergeFn::Average(f) => f.reset_epoch(params),
            MergeFn::GlobalSum(f) => f.reset_epoch(params),
            MergeFn::AdaptiveGradient(f) => f.reset_epoch(params),
        }
    }
}
