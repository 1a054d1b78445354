use model_sync::{ModelLayout, SyncModel, TensorShape};
use rand::{Rng, SeedableRng, rngs::StdRng};

/// A linear regression model, `y = w·x + b`, trained with a squared error loss.
///
/// Stands in for the numeric layer: the synchronizer only ever sees its flattened weights
/// followed by its bias.
#[derive(Debug, Clone)]
pub struct LinearModel {
    params: Vec<f32>,
    grad: Vec<f32>,
}

impl LinearModel {
    pub fn zeros(features: usize) -> Self {
        Self {
            params: vec![0.; features + 1],
            grad: vec![0.; features + 1],
        }
    }

    /// Creates a model with small random weights and a zero bias.
    pub fn random<R: Rng>(features: usize, rng: &mut R) -> Self {
        let mut model = Self::zeros(features);
        model.params[..features]
            .iter_mut()
            .for_each(|w| *w = rng.random_range(-0.1..0.1));
        model
    }

    pub fn features(&self) -> usize {
        self.params.len() - 1
    }

    pub fn predict(&self, x: &[f32]) -> f32 {
        let (weights, bias) = self.params.split_at(self.features());
        weights.iter().zip(x).map(|(w, x)| w * x).sum::<f32>() + bias[0]
    }

    /// Computes the mean gradient of the loss over a batch.
    ///
    /// # Arguments
    /// * `xs` - The batch inputs, `features` values per sample.
    /// * `ys` - The batch targets.
    /// * `tolerance` - Maximum error of a correct prediction.
    ///
    /// # Returns
    /// The summed loss and the amount of correct predictions.
    pub fn backward(&mut self, xs: &[f32], ys: &[f32], tolerance: f32) -> (f64, usize) {
        let features = self.features();
        let n = ys.len().max(1) as f32;

        self.grad.fill(0.);
        let mut loss = 0.;
        let mut correct = 0;

        for (x, y) in xs.chunks_exact(features).zip(ys) {
            let err = self.predict(x) - y;
            loss += 0.5 * (err as f64).powi(2);

            if err.abs() <= tolerance {
                correct += 1;
            }

            let (dw, db) = self.grad.split_at_mut(features);
            dw.iter_mut().zip(x).for_each(|(g, x)| *g += err * x / n);
            db[0] += err / n;
        }

        (loss, correct)
    }
}

impl SyncModel for LinearModel {
    fn num_params(&self) -> usize {
        self.params.len()
    }

    fn get_params(&self, out: &mut [f32]) {
        out.copy_from_slice(&self.params);
    }

    fn set_params(&mut self, params: &[f32]) {
        self.params.copy_from_slice(params);
    }

    fn get_gradient(&self, out: &mut [f32]) {
        out.copy_from_slice(&self.grad);
    }

    fn layout(&self) -> ModelLayout {
        ModelLayout::new(vec![
            TensorShape::new("weights", vec![self.features()]),
            TensorShape::new("bias", vec![1]),
        ])
    }
}

/// An endless stream of noisy samples of a fixed linear function.
pub struct SyntheticData {
    truth: LinearModel,
    noise: f32,
    rng: StdRng,
}

impl SyntheticData {
    /// Creates a new `SyntheticData` stream.
    ///
    /// # Arguments
    /// * `features` - The input size.
    /// * `seed` - Picks the target function, equal seeds give equal functions.
    /// * `stream` - Picks the samples, every worker should use its own.
    /// * `noise` - Amplitude of the noise added to the targets.
    pub fn new(features: usize, seed: u64, stream: u64, noise: f32) -> Self {
        let mut truth_rng = StdRng::seed_from_u64(seed);
        let mut truth = LinearModel::zeros(features);
        truth
            .params
            .iter_mut()
            .for_each(|p| *p = truth_rng.random_range(-1.0..1.0));

        Self {
            truth,
            noise,
            rng: StdRng::seed_from_u64(seed.wrapping_add(stream).wrapping_add(1)),
        }
    }

    /// The parameters generating the data.
    pub fn truth(&self) -> &[f32] {
        &self.truth.params
    }

    /// Fills `xs` and `ys` with `n` new samples.
    pub fn fill(&mut self, n: usize, xs: &mut Vec<f32>, ys: &mut Vec<f32>) {
        let features = self.truth.features();

        xs.clear();
        ys.clear();

        for _ in 0..n {
            let start = xs.len();
            xs.extend((0..features).map(|_| self.rng.random_range(-1.0..1.0)));

            let noise = if self.noise > 0. {
                self.rng.random_range(-self.noise..self.noise)
            } else {
                0.
            };
            ys.push(self.truth.predict(&xs[start..]) + noise);
        }
    }
}
