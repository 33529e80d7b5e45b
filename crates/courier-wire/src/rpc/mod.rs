//! Unary RPC transport.
//!
//! Every request or notification is one call on a TCP connection to the
//! destination of its type. Calls and replies are length-prefixed JSON frames.

pub mod channel;
pub mod dispatcher;
pub mod frame;
pub mod listener;

pub use channel::{ChannelPool, RpcChannel, RpcClient};
pub use dispatcher::RpcDispatcher;
pub use frame::{RpcEnvelope, RpcFrame, RpcFrameKind, WireError};
pub use listener::RpcListener;
