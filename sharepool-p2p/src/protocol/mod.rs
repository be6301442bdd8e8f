//! Wire protocol: framing and message codecs.

pub mod framing;
pub mod messages;
pub mod wire;

pub use framing::{FrameCodec, Inbound};
pub use messages::{
    reply_result, AddressEntry, Message, PeerAddress, ShareReplyMessage, ShareReqMessage,
    VersionMessage,
};
