/// Primitive number types whose alignment is at least 4 bytes.
///
/// Receiving buffers are backed by these so that `f32` payloads can be viewed in place.
pub trait Align4: bytemuck::Pod {}

impl Align4 for u32 {}
impl Align4 for i32 {}
impl Align4 for u64 {}
impl Align4 for i64 {}
impl Align4 for f32 {}
impl Align4 for f64 {}
