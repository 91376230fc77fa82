//! Client wire protocol.
//!
//! Frames are length-prefixed: a fixed header carrying the total length,
//! the protocol version octet and the opcode, followed by a packed payload.
//! Socket handling is the embedder's concern; this module only converts
//! between frames and typed request/response values.

pub(crate) mod argument;
pub mod reply;
pub mod request;
pub mod wire;

pub use reply::{AllocElt, RespContainer, Response};
pub use request::{DecodeError, Message, Operation, ReleaseElt, RequestKind};
pub use wire::PROTOCOL_VERSION;
