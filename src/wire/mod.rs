//! Byte-level transport: buffered channel, scalar primitives and the batch
//! request/reply codec.
pub mod channel;
pub mod codec;
pub mod primitives;

pub use channel::{ChannelError, WireChannel, WouldBlock};
pub use codec::{CodecError, WireError};
