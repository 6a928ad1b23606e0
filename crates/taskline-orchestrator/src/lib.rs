pub mod model;
pub mod tree;

pub use model::*;
pub use tree::*;
