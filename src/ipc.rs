//! Transport to the host process.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    Unix socket / TCP     ┌─────────────────────┐
//! │   SimClient     │  ◄────────────────────►  │  host + server      │
//! │   (Link)        │   JSON frames + framing  │  module             │
//! └─────────────────┘                          └─────────────────────┘
//! ```
//!
//! # Protocol
//!
//! Frames use HTTP-style Content-Length framing (same as LSP):
//!
//! ```text
//! Content-Length: 55\r\n
//! \r\n
//! {"kind":"command","token":1,"command_id":"ping"}
//! ```

mod framing;
mod transport;

pub use framing::{read_frame, write_frame, MAX_FRAME_SIZE};
pub use transport::{Connector, FrameSink, Link, LinkTasks, MemoryPeer, SocketConnector};
