use super::{MergeCtx, MergeFunction};

/// Adds every incoming update to the parameters as is.
///
/// Meant for updates the caller already scaled, e.g. divided by the global batch size.
#[derive(Debug, Clone, Copy)]
pub struct GlobalSum;

impl MergeFunction for GlobalSum {
    fn merge(&mut self, params: &mut [f32], incoming: &[f32], ctx: &MergeCtx) {
        for (p, g) in params.iter_mut().zip(incoming) {
            *p += ctx.prepare(*g);
        }
    }
}
