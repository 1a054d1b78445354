use std::{num::NonZeroUsize, ops::Range};

use parking_lot::Mutex;
use rayon::prelude::*;

use super::ParameterShard;
use crate::{
    error::{Result, SyncErr},
    merge::{MergeCtx, MergeFn},
};

/// The canonical parameter buffer of a process, split in shards that can be updated in parallel.
///
/// Every shard has its own lock. Whole-buffer atomicity is the job of the parameter lock in
/// `ModelSync`, these locks only keep each shard's slice and merge state consistent.
#[derive(Debug)]
pub struct ParameterStore {
    nparams: usize,
    shard_size: NonZeroUsize,
    shards: Box<[Mutex<ParameterShard>]>,
}

impl ParameterStore {
    /// Creates a new `ParameterStore`.
    ///
    /// # Arguments
    /// * `params` - The initial flattened parameters.
    /// * `shard_size` - The maximum amount of parameters per shard.
    /// * `merge_factory` - Builds the merge function of a shard given its initial parameters.
    ///
    /// # Returns
    /// A new `ParameterStore` instance.
    pub fn new<F>(params: Vec<f32>, shard_size: NonZeroUsize, mut merge_factory: F) -> Self
    where
        F: FnMut(&[f32]) -> MergeFn,
    {
        let shards = params
            .chunks(shard_size.get())
            .map(|chunk| {
                let merge_fn = merge_factory(chunk);
                Mutex::new(ParameterShard::new(chunk.to_vec(), merge_fn))
            })
            .collect();

        Self {
            nparams: params.len(),
            shard_size,
            shards,
        }
    }

    /// Returns the amount of parameters in the store.
    pub fn len(&self) -> usize {
        self.nparams
    }

    pub fn is_empty(&self) -> bool {
        self.nparams == 0
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if self.nparams != len {
            return Err(SyncErr::SizeMismatch {
                got: len,
                expected: self.nparams,
            });
        }

        Ok(())
    }

    fn range(&self, shard: usize) -> Range<usize> {
        let start = shard * self.shard_size.get();
        start..(start + self.shard_size.get()).min(self.nparams)
    }

    /// Merges a full update into every shard.
    ///
    /// # Arguments
    /// * `incoming` - A flat update the length of the store.
    /// * `ctx` - The merge context.
    ///
    /// # Returns
    /// A `SizeMismatch` error if `incoming` doesn't match the size of the store.
    pub fn merge(&self, incoming: &[f32], ctx: &MergeCtx) -> Result<()> {
        self.check_len(incoming.len())?;

        self.shards
            .par_iter()
            .zip(incoming.par_chunks(self.shard_size.get()))
            .try_for_each(|(shard, slice)| shard.lock().merge(slice, ctx))
    }

    /// Gathers every shard into `out`.
    ///
    /// # Returns
    /// A `SizeMismatch` error if `out` doesn't match the size of the store.
    pub fn pull(&self, out: &mut [f32]) -> Result<()> {
        self.check_len(out.len())?;

        self.shards
            .par_iter()
            .zip(out.par_chunks_mut(self.shard_size.get()))
            .try_for_each(|(shard, slice)| shard.lock().pull(slice))
    }

    /// Copies the whole buffer.
    pub fn snapshot(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.nparams);

        for shard in self.shards.iter() {
            out.extend_from_slice(shard.lock().params());
        }

        out
    }

    /// Overwrites the buffer with `params` and starts a new merge epoch.
    ///
    /// # Returns
    /// A `SizeMismatch` error if `params` doesn't match the size of the store.
    pub fn overwrite(&self, params: &[f32]) -> Result<()> {
        self.check_len(params.len())?;

        self.shards.par_iter().enumerate().for_each(|(i, shard)| {
            let src = &params[self.range(i)];
            shard.lock().rewrite(|dst| dst.copy_from_slice(src));
        });

        Ok(())
    }

    /// Moves the buffer by `remote - snapshot` and starts a new merge epoch.
    ///
    /// Whatever was merged after `snapshot` was taken is kept.
    ///
    /// # Arguments
    /// * `snapshot` - The buffer as it was sent to the remote side.
    /// * `remote` - The buffer the remote side answered with.
    ///
    /// # Returns
    /// A `SizeMismatch` error if either buffer doesn't match the size of the store.
    pub fn reconcile(&self, snapshot: &[f32], remote: &[f32]) -> Result<()> {
        self.check_len(snapshot.len())?;
        self.check_len(remote.len())?;

        self.shards.par_iter().enumerate().for_each(|(i, shard)| {
            let range = self.range(i);
            let (snapshot, remote) = (&snapshot[range.clone()], &remote[range]);

            shard.lock().rewrite(|params| {
                params
                    .iter_mut()
                    .zip(snapshot.iter().zip(remote))
                    .for_each(|(p, (s, r))| *p += r - s);
            });
        });

        Ok(())
    }

    /// Replaces the buffer by the element-wise mean of itself and `others`, starting a new
    /// merge epoch.
    ///
    /// # Returns
    /// A `SizeMismatch` error if any of `others` doesn't match the size of the store.
    pub fn average_with(&self, others: &[&[f32]]) -> Result<()> {
        for other in others {
            self.check_len(other.len())?;
        }

        let n = (others.len() + 1) as f32;

        self.shards.par_iter().enumerate().for_each(|(i, shard)| {
            let range = self.range(i);

            shard.lock().rewrite(|params| {
                for (j, p) in params.iter_mut().enumerate() {
                    let idx = range.start + j;
                    let sum: f32 = others.iter().map(|other| other[idx]).sum();
                    *p = (*p + sum) / n;
                }
            });
        });

        Ok(())
    }

    /// Starts a new merge epoch on every shard.
    pub fn reset_epoch(&self) {
        self.shards
            .par_iter()
            .for_each(|shard| shard.lock().reset_epoch());
    }
}
