//! Lifecycle logging shared by the server and the per-task dispatchers.

mod event;
mod logging;

pub use event::*;
pub use logging::*;
