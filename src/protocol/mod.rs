//! Wire format of RPC request and reply bodies.
//!
//! Bodies are JSON. Correlation and reply routing live in envelope metadata
//! (see [`Envelope`](crate::Envelope)), never in these types.
mod message;

pub use message::{ReplyStatus, RpcReply, RpcRequest};
