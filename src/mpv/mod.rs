//! MPV IPC module - spawns and controls an external MPV player via JSON IPC.
//!
//! Architecture:
//! - `process.rs` - MPV process spawning, readiness and exit watching
//! - `ipc.rs` - Unix socket connection, pre-connection buffer and reply slots
//! - `codec.rs` - Newline-delimited JSON framing
//! - `dispatch.rs` - Routing of frames to reply slots and event subscribers
//! - `driver.rs` - The single task that owns all of the above
//! - `protocol.rs` - JSON command/reply/event types
//! - `client.rs` - High-level MPV client with command methods

mod client;
mod codec;
mod dispatch;
mod driver;
mod error;
mod ipc;
mod process;
mod protocol;

pub use client::{ClientState, CommandSender, MpvClient, PendingCommand};
pub use codec::{sanitize, DecodeError, DecodedFrame, FrameDecoder, Frames};
pub use dispatch::{ClientEvent, HandlerId, Topic};
pub use error::MpvError;
pub use process::{find_mpv, launch_args};
pub use protocol::{Command, Incoming, MpvEvent, Reply, SUCCESS};
