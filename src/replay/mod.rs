//! Event replay at startup.
//!
//! Each captured stream is read forward from version 0. Empty placeholder
//! events are skipped, everything else goes to the stream's handler. The
//! [`ReplayGate`] fires once all streams have reached their end, which is
//! when the service may announce itself as ready.
//!
//! Broker topics are captured the same way through [`TopicReader`], without
//! a catch-up phase.

pub mod config;
pub mod gate;
pub mod handler;
pub mod progress;
pub mod reader;
pub mod topics;

pub use config::ReplayConfig;
pub use gate::ReplayGate;
pub use handler::{handler_fn, EventHandler, FnHandler, HttpForwardHandler};
pub use progress::{ProgressSnapshot, ReplayProgress};
pub use reader::{ReplayHandle, ReplayReader};
pub use topics::{TopicListener, TopicReader, TopicSource};
