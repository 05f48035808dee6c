//! Supervise an MPV process and drive it over its JSON IPC socket.
//!
//! ```no_run
//! use mpv_ipc::{MpvClient, MpvConfig};
//!
//! # async fn demo() -> Result<(), mpv_ipc::MpvError> {
//! let client = MpvClient::new(MpvConfig::default())?;
//! client.on("pause", |event| println!("paused: {:?}", event));
//! let volume = client.get_property("volume").await?;
//! println!("volume is {}", volume);
//! client.terminate().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod mpv;

pub use config::{MpvConfig, DEFAULT_READY_MARKER};
pub use mpv::*;
