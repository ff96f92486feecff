//! Application-layer wire protocol between training nodes.
//!
//! Workers and parameter servers exchange framed messages over any pair of
//! async byte streams: control commands and replies travel as serde-encoded
//! bodies, gradient and weight chunks travel as raw little-endian f32 slices
//! written zero-copy after the frame header.

mod deserialize;
pub mod msg;
mod receiver;
mod sender;
mod serialize;
pub mod specs;

use tokio::io::{AsyncRead, AsyncWrite};

pub use deserialize::Deserialize;
pub use receiver::WireReceiver;
pub use sender::WireSender;
pub use serialize::Serialize;

type LenType = u64;
const LEN_TYPE_SIZE: usize = std::mem::size_of::<LenType>();

/// Creates both `WireReceiver` and `WireSender` channel parts.
///
/// Given a reader and a writer, returns both ends of the framed
/// communication.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// The receiving and sending halves of the channel.
pub fn channel<R, W>(rx: R, tx: W) -> (WireReceiver<R>, WireSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (WireReceiver::new(rx), WireSender::new(tx))
}
