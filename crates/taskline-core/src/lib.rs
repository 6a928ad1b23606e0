pub mod action;
pub mod actor;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod event_sink;
pub mod prompts;
pub mod registry;
pub mod stream_guard;
pub mod workspace;

pub use action::*;
pub use actor::*;
pub use config::*;
pub use context::*;
pub use dispatcher::*;
pub use engine::*;
pub use error::*;
pub use event_sink::*;
pub use registry::*;
pub use stream_guard::*;

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
