//! TCP transport: length-prefixed text framing, per-peer connections with
//! cooperative cancellation, and the dispatcher accept loop.

pub mod codec;
pub mod connection;
pub mod framing;
pub mod listener;
pub mod platform;

pub use codec::WireMessage;
pub use connection::{CloseReason, Connection, ConnectionEvent, ConnectionState};
pub use framing::{Frame, FrameConfig, FrameDecoder, FrameError, encode_frame, write_frame};
pub use listener::{ConnectionId, ConnectionLimitReached, ConnectionMap, Listener, ServerConfig};
pub use platform::{
    ConnectError, SocketConfig, bind_address, configure_stream, create_listener, resolve_address,
};
