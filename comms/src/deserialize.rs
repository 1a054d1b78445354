use std::io;

/// Reads a value out of a received frame, borrowing from it where possible.
pub trait Deserialize<'a>: Sized {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self>;
}
