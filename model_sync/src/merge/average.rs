use super::{MergeCtx, MergeFunction};

/// Keeps the parameters at the epoch base plus the mean of every update merged during the epoch.
///
/// Sums are kept apart from the base so the result doesn't depend on the arrival order.
#[derive(Debug)]
pub struct Average {
    base: Box<[f32]>,
    sum: Box<[f32]>,
    contributions: usize,
}

impl Average {
    /// Creates a new `Average` merge function.
    ///
    /// # Arguments
    /// * `params` - The parameters at the start of the first epoch.
    ///
    /// # Returns
    /// A new `Average` instance.
    pub fn new(params: &[f32]) -> Self {
        Self {
            base: params.into(),
            sum: vec![0.; params.len()].into_boxed_slice(),
            contributions: 0,
        }
    }

    /// The amount of updates merged since the last epoch reset.
    pub fn contributions(&self) -> usize {
        self.contributions
    }
}

impl MergeFunction for Average {
    fn merge(&mut self, params: &mut [f32], incoming: &[f32], ctx: &MergeCtx) {
        self.contributions += 1;
        let n = self.contributions as f32;

        params
            .iter_mut()
            .zip(incoming)
            .zip(self.base.iter())
            .zip(self.sum.iter_mut())
            .for_each(|(((p, g), base), sum)| {
                *sum += ctx.prepare(*g);
                *p = base + *sum / n;
            });
    }

    fn reset_epoch(&mut self, params: &[f32]) {
        self.base.copy_from_slice(params);
        self.sum.fill(0.);
        self.contributions = 0;
    }
}
