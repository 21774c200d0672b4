/// Packet definitions and flags
pub mod packet;
/// Packet codec for encoding and decoding
pub mod codec;
/// Transform/Wrapper pipeline and wire framing
pub mod pipeline;

pub use codec::*;
pub use packet::*;
pub use pipeline::*;
