//! JSON-RPC transport for the SQL Tools Service engine.
//!
//! This module is the Rust-side boundary to the engine process. Requests go
//! out over the engine's stdin and replies and events come back over its
//! stdout, both using JSON-RPC 2.0.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐      stdin / stdout       ┌─────────────────────┐
//! │  JsonRpcClient   │ ◄────────────────────────►│  SQL Tools Service  │
//! │ (reader thread)  │  JSON-RPC 2.0 + framing   │      (engine)       │
//! └──────────────────┘                           └─────────────────────┘
//! ```
//!
//! # Protocol
//!
//! Messages use HTTP-style Content-Length framing (same as LSP):
//!
//! ```text
//! Content-Length: 64\r\n
//! \r\n
//! {"jsonrpc":"2.0","method":"scripting/script","params":{},"id":1}
//! ```

mod client;
mod framing;

pub use client::{
    ClientState, JsonRpcClient, RequestId, TransportError, DEFAULT_SHUTDOWN_GRACE,
    MAX_HELD_NOTIFICATIONS,
};
pub use framing::{
    encode_message, encode_request, read_message, FrameDecoder, FramingError, MAX_MESSAGE_SIZE,
};
