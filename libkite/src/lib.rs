#![forbid(unsafe_code)]

//! # kite
//!
//! The shared code for kite. Encapsulates abstractions for things like:
//!
//! - Signed calls against the cloud platform's job API
//! - Flattening nested job payloads into environment variables
//! - Remembering which jobs were already handled between runs
//! - Dispatching finished jobs to local hooks and to a message queue
//!   - Hooks are plain executables named `<event>-<anything>` in a hooks
//!     directory, so any language can react to platform events.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod log;
pub mod payload;
pub mod poller;
pub mod store;

pub use config::Config;
pub use error::{KiteError, Result};
