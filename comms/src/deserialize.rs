use std::io;

/// Types that can be decoded from a framed message.
pub trait Deserialize<'a>: Sized {
    /// Decodes a value from a complete frame.
    ///
    /// The frame is 4-byte aligned so numeric payloads can be reborrowed in
    /// place; the returned value may borrow from `buf`.
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self>;
}
