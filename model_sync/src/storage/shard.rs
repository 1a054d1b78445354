use crate::{
    error::{Result, SyncErr},
    merge::{MergeCtx, MergeFn, MergeFunction},
};

/// A contiguous slice of the canonical buffer together with its merge state.
#[derive(Debug)]
pub struct ParameterShard {
    params: Box<[f32]>,
    merge_fn: MergeFn,
}

impl ParameterShard {
    /// Creates a new `ParameterShard`.
    ///
    /// # Arguments
    /// * `params` - The initial state of the parameters.
    /// * `merge_fn` - The merge function owning this shard's merge state.
    ///
    /// # Returns
    /// A new `ParameterShard` instance.
    pub fn new(params: Vec<f32>, merge_fn: MergeFn) -> Self {
        Self {
            params: params.into_boxed_slice(),
            merge_fn,
        }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if self.params.len() != len {
            return Err(SyncErr::SizeMismatch {
                got: len,
                expected: self.params.len(),
            });
        }

        Ok(())
    }

    /// Merges `incoming` into the shard's parameters.
    ///
    /// # Arguments
    /// * `incoming` - This shard's slice of the update.
    /// * `ctx` - The merge context of the whole update.
    ///
    /// # Returns
    /// A `SizeMismatch` error if `incoming` isn't the same size as this shard.
    pub fn merge(&mut self, incoming: &[f32], ctx: &MergeCtx) -> Result<()> {
        self.check_len(incoming.len())?;
        self.merge_fn.merge(&mut self.params, incoming, ctx);
        Ok(())
    }

    /// Copies the shard's parameters into `out`.
    ///
    /// # Returns
    /// A `SizeMismatch` error if `out` isn't the same size as this shard.
    pub fn pull(&self, out: &mut [f32]) -> Result<()> {
        self.check_len(out.len())?;
        out.copy_from_slice(&self.params);
        Ok(())
    }

    /// Replaces the parameters by the result of `f` and starts a new merge epoch.
    ///
    /// # Arguments
    /// * `f` - Receives the current parameters and rewrites them in place.
    pub fn rewrite<F>(&mut self, f: F)
    where
        F: FnOnce(&mut [f32]),
    {
        f(&mut self.params);
        self.merge_fn.reset_epoch(&self.params);
    }

    pub fn reset_epoch(&mut self) {
        self.merge_fn.reset_epoch(&self.params);
    }
}
