use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Deserialize, LEN_TYPE_SIZE, LenType};

/// The receiving end handle of the communication.
pub struct WireReceiver<R: AsyncRead + Unpin> {
    rx: R,
    // u32 backing keeps the frame 4-byte aligned for in-place f32 views.
    buf: Vec<u32>,
}

impl<R: AsyncRead + Unpin> WireReceiver<R> {
    /// Creates a new `WireReceiver` instance.
    ///
    /// # Arguments
    /// * `rx` - The underlying reader.
    pub(super) fn new(rx: R) -> Self {
        Self { rx, buf: Vec::new() }
    }

    /// Waits for the next framed message on the stream.
    ///
    /// # Returns
    /// The decoded message, borrowing from the receiver's internal buffer, or
    /// an `io::Error` on a broken stream or a malformed frame.
    pub async fn recv<'s, T>(&'s mut self) -> io::Result<T>
    where
        T: Deserialize<'s>,
    {
        let mut len_buf = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut len_buf).await?;
        let len = LenType::from_be_bytes(len_buf) as usize;

        let words = len.div_ceil(std::mem::size_of::<u32>());
        self.buf.clear();
        self.buf.resize(words, 0);

        let view: &mut [u8] = bytemuck::cast_slice_mut(&mut self.buf);
        let frame = &mut view[..len];
        self.rx.read_exact(frame).await?;

        T::deserialize(frame)
    }
}
