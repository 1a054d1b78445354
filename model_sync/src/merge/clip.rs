use serde::{Deserialize, Serialize};

/// Gradient clipping applied to an incoming update before it is merged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradientClip {
    /// Clamps every element to `[-value, value]`.
    Value(f32),
    /// Rescales the whole update so that its L2 norm is at most `norm`.
    Norm(f32),
}

impl GradientClip {
    pub fn threshold(&self) -> f32 {
        match *self {
            GradientClip::Value(v) | GradientClip::Norm(v) => v,
        }
    }

    /// Computes the factor every element of `update` must be multiplied by.
    ///
    /// The norm has to be taken over the whole update, before it is split into shards.
    ///
    /// # Arguments
    /// * `update` - The complete incoming update.
    ///
    /// # Returns
    /// The scale to pass along in the `MergeCtx`.
    pub fn scale_for(&self, update: &[f32]) -> f32 {
        let GradientClip::Norm(max_norm) = *self else {
            return 1.;
        };

        let norm = update.iter().map(|g| g * g).sum::<f32>().sqrt();

        if norm > max_norm {
            max_norm / norm
        } else {
            1.
        }
    }

    /// Clips a single, already scaled, element.
    pub fn clamp(&self, g: f32) -> f32 {
        match *self {
            GradientClip::Value(v) => g.clamp(-v, v),
            GradientClip::Norm(_) => g,
        }
    }
}
