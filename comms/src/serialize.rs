/// Types that can be encoded into a framed message.
pub trait Serialize<'a> {
    /// Appends the message header and any encoded body to `buf`.
    ///
    /// A borrowed numeric tail may be returned instead of being copied into
    /// `buf`; the sender writes it on the wire directly after the buffered
    /// part.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}
