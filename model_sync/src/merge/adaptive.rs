use super::{MergeCtx, MergeFunction};

/// Applies a bias-corrected adaptive step (Adam family) for every incoming gradient.
///
/// Updates are folded in arrival order. With asynchronous workers the moments mix gradients
/// computed against different parameter versions, so the result approximates sequential
/// training instead of reproducing it.
#[derive(Debug)]
pub struct AdaptiveGradient {
    beta1: f32,
    beta2: f32,
    beta1_t: f32,
    beta2_t: f32,
    m: Box<[f32]>,
    v: Box<[f32]>,
    epsilon: f32,
}

impl AdaptiveGradient {
    /// Creates a new `AdaptiveGradient` merge function.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold moments for.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters of the moment estimates.
    ///
    /// # Returns
    /// A new `AdaptiveGradient` instance.
    pub fn new(len: usize, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            beta1,
            beta2,
            beta1_t: 1.,
            beta2_t: 1.,
            m: vec![0.; len].into_boxed_slice(),
            v: vec![0.; len].into_boxed_slice(),
            epsilon,
        }
    }
}

impl MergeFunction for AdaptiveGradient {
    fn merge(&mut self, params: &mut [f32], incoming: &[f32], ctx: &MergeCtx) {
        let Self {
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;

        let bc1 = 1. - self.beta1_t;
        let bc2 = 1. - self.beta2_t;
        let step_size = ctx.learning_rate * (bc2.sqrt() / bc1);

        params
            .iter_mut()
            .zip(incoming)
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
            .for_each(|(((p, g), m), v)| {
                let g = ctx.prepare(*g);
                *m = b1 * *m + (1. - b1) * g;
                *v = b2 * *v + (1. - b2) * g * g;
                *p -= step_size * *m / (v.sqrt() + eps);
            });
    }
}
