use serde::{Deserialize, Serialize};

/// The flattened view of a model the synchronizer works with.
///
/// Implemented by the numeric layer. The order and the length of the flattened vectors must
/// stay fixed during the whole run.
pub trait SyncModel {
    /// Total amount of parameters across every tensor.
    fn num_params(&self) -> usize;

    /// Copies the flattened parameters into `out`.
    fn get_params(&self, out: &mut [f32]);

    /// Overwrites the model's parameters with `params`.
    fn set_params(&mut self, params: &[f32]);

    /// Copies the flattened gradient of the last backward pass into `out`.
    fn get_gradient(&self, out: &mut [f32]);

    /// The per-tensor shapes, in flattening order.
    fn layout(&self) -> ModelLayout;
}

/// The shape of one named tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorShape {
    pub name: String,
    pub dims: Vec<usize>,
}

impl TensorShape {
    pub fn new(name: impl Into<String>, dims: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            dims,
        }
    }

    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The ordered list of tensors making up a flattened parameter vector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLayout {
    pub tensors: Vec<TensorShape>,
}

impl ModelLayout {
    pub fn new(tensors: Vec<TensorShape>) -> Self {
        Self { tensors }
    }

    /// Total amount of parameters described by the layout.
    pub fn num_params(&self) -> usize {
        self.tensors.iter().map(TensorShape::len).sum()
    }

    /// The range every tensor occupies in the flattened vector.
    pub fn offsets(&self) -> impl Iterator<Item = (&str, std::ops::Range<usize>)> {
        self.tensors.iter().scan(0, |start, tensor| {
            let range = *start..*start + tensor.len();
            *start = range.end;
            Some((tensor.name.as_str(), range))
        })
    }
}

/// What the synchronizer hands back to the serialization layer at shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub num_params: usize,
    pub tensors: Vec<TensorShape>,
    pub params: Vec<f32>,
}
