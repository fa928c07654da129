//! Configuration for the arbor tree engine.

mod tree;

pub use tree::TreeConfig;
