mod conversation;
mod event;
mod options;
mod status;

pub use conversation::*;
pub use event::*;
pub use options::*;
pub use status::*;
